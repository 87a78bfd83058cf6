pub mod checkout;
pub mod settlement;
pub mod verification;

pub use checkout::{CheckoutCommand, CheckoutService, CheckoutSettings, IssuedCheckout};
pub use settlement::{
    ReconcileOutcome, Settlement, SettlementOutcome, SettlementReconciler, SettlementSignal,
    SignalSource,
};
pub use verification::VerificationService;
