//! Ledger Store records touched by checkout and settlement.

pub mod attendee;
pub mod event;
pub mod payment;
pub mod ticket;

pub use attendee::Entity as Attendee;
pub use event::Entity as Event;
pub use payment::Entity as Payment;
pub use ticket::Entity as Ticket;
