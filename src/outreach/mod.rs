//! Outreach core: ledger model, template rendering, dispatch and mailbox
//! reconciliation.

pub mod dispatch;
pub mod intake;
pub mod model;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod template;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::{DispatchEngine, FirstSendReport, FollowUpOptions, FollowUpReport};
pub use reconcile::{MailboxReconciler, ReconcileReport};
