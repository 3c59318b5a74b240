//! Persistence layer: libSQL-backed recipient ledger, templates and credentials.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
