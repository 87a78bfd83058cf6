use anyhow::Result;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::prelude::*;
use std::time::Duration;
use tracing::{error, info};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_events_table::Migration),
            Box::new(m20240601_000002_create_tickets_table::Migration),
            Box::new(m20240601_000003_create_payments_table::Migration),
            Box::new(m20240601_000004_create_attendees_table::Migration),
        ]
    }
}

mod m20240601_000001_create_events_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_events_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Events::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Events::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Events::Title).string().not_null())
                        .col(
                            ColumnDef::new(Events::TicketsSold)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Events::Capacity).integer().null())
                        .col(
                            ColumnDef::new(Events::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Events::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Events::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Events {
        Table,
        Id,
        Title,
        TicketsSold,
        Capacity,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_tickets_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_tickets_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Tickets::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Tickets::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Tickets::EventId).uuid().not_null())
                        .col(ColumnDef::new(Tickets::AttendeeId).uuid().not_null())
                        .col(
                            ColumnDef::new(Tickets::Quantity)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(Tickets::UnitPrice)
                                .decimal_len(19, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Tickets::TotalAmount)
                                .decimal_len(19, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Tickets::Status).string_len(20).not_null())
                        .col(
                            ColumnDef::new(Tickets::PaymentStatus)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Tickets::TicketNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Tickets::QrCode).string().null())
                        .col(
                            ColumnDef::new(Tickets::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Tickets::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_tickets_event_id")
                                .from(Tickets::Table, Tickets::EventId)
                                .to(Events::Table, Events::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_tickets_event_id")
                        .table(Tickets::Table)
                        .col(Tickets::EventId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Tickets::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Tickets {
        Table,
        Id,
        EventId,
        AttendeeId,
        Quantity,
        UnitPrice,
        TotalAmount,
        Status,
        PaymentStatus,
        TicketNumber,
        QrCode,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Events {
        Table,
        Id,
    }
}

mod m20240601_000003_create_payments_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_payments_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Payments::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Payments::TicketId).uuid().not_null())
                        .col(ColumnDef::new(Payments::UserId).uuid().not_null())
                        .col(ColumnDef::new(Payments::UserEmail).string().null())
                        .col(ColumnDef::new(Payments::EventId).uuid().not_null())
                        .col(
                            ColumnDef::new(Payments::Amount)
                                .decimal_len(19, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Payments::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Payments::PaymentMethod).string().not_null())
                        .col(ColumnDef::new(Payments::Status).string_len(20).not_null())
                        .col(
                            ColumnDef::new(Payments::GatewayTransactionId)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::CheckoutSessionId)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::RefundAmount)
                                .decimal_len(19, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Payments::RefundReason).string().null())
                        .col(ColumnDef::new(Payments::Metadata).json().not_null())
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::SettledAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payments_ticket_id")
                                .from(Payments::Table, Payments::TicketId)
                                .to(Tickets::Table, Tickets::Id),
                        )
                        .to_owned(),
                )
                .await?;

            // Lookup path 1
            manager
                .create_index(
                    Index::create()
                        .name("uq_payments_gateway_transaction_id")
                        .table(Payments::Table)
                        .col(Payments::GatewayTransactionId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            // Lookup path 2
            manager
                .create_index(
                    Index::create()
                        .name("uq_payments_checkout_session_id")
                        .table(Payments::Table)
                        .col(Payments::CheckoutSessionId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            // Lookup path 3
            manager
                .create_index(
                    Index::create()
                        .name("idx_payments_ticket_id_status")
                        .table(Payments::Table)
                        .col(Payments::TicketId)
                        .col(Payments::Status)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        Id,
        TicketId,
        UserId,
        UserEmail,
        EventId,
        Amount,
        Currency,
        PaymentMethod,
        Status,
        GatewayTransactionId,
        CheckoutSessionId,
        RefundAmount,
        RefundReason,
        Metadata,
        CreatedAt,
        UpdatedAt,
        SettledAt,
    }

    #[derive(DeriveIden)]
    enum Tickets {
        Table,
        Id,
    }
}

mod m20240601_000004_create_attendees_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_attendees_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Attendees::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Attendees::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Attendees::EventId).uuid().not_null())
                        .col(ColumnDef::new(Attendees::UserId).uuid().not_null())
                        .col(ColumnDef::new(Attendees::TicketId).uuid().not_null())
                        .col(ColumnDef::new(Attendees::PaymentId).uuid().not_null())
                        .col(
                            ColumnDef::new(Attendees::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // Second line of defense against double settlement
            manager
                .create_index(
                    Index::create()
                        .name("uq_attendees_ticket_id")
                        .table(Attendees::Table)
                        .col(Attendees::TicketId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_attendees_event_id")
                        .table(Attendees::Table)
                        .col(Attendees::EventId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Attendees::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Attendees {
        Table,
        Id,
        EventId,
        UserId,
        TicketId,
        PaymentId,
        CreatedAt,
    }
}

/// Standalone migration runner used by `eventhub-payments migrate`.
pub async fn run_migration(db_url: &str) -> Result<()> {
    info!("Setting up database connection for migrations");

    let mut opt = ConnectOptions::new(db_url);
    opt.max_connections(2)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;

    info!("Running database migrations");

    match Migrator::up(&db, None).await {
        Ok(_) => {
            info!("Migrations completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Migration failed: {}", e);
            Err(e.into())
        }
    }
}
