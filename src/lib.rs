//! Outreach sequencer: two-stage cold-email sequences with reply and bounce
//! reconciliation.

pub mod api;
pub mod config;
pub mod error;
pub mod mail;
pub mod outreach;
pub mod store;
