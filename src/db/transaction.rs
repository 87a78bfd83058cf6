/*!
 * Transaction helper
 *
 * Runs a closure inside one database transaction: commit on `Ok`, rollback on `Err`.
 */

use crate::errors::ServiceError;
use metrics::counter;
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionError, TransactionTrait};
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Type alias for boxed future used in transactions
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Execute a function within a database transaction
///
/// The closure's own `ServiceError` is returned unchanged, so callers can
/// distinguish business rejections from storage failures after rollback.
///
/// # Example
///
/// ```rust,ignore
/// let attendee = with_transaction(&db, |txn| {
///     Box::pin(async move {
///         let ticket = ticket::Entity::find_by_id(id).one(txn).await?;
///         Ok(ticket)
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<F, T>(db: &DatabaseConnection, f: F) -> Result<T, ServiceError>
where
    F: for<'c> FnOnce(&'c DatabaseTransaction) -> BoxFuture<'c, Result<T, ServiceError>> + Send,
    T: Send,
{
    let result = db.transaction::<F, T, ServiceError>(f).await;

    match &result {
        Ok(_) => counter!("eventhub_db.transaction.committed", 1),
        Err(_) => {
            debug!("transaction rolled back");
            counter!("eventhub_db.transaction.rolled_back", 1);
        }
    }

    result.map_err(|e| match e {
        TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
        TransactionError::Transaction(err) => err,
    })
}
