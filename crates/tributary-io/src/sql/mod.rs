//! SQL Server sources
//!
//! Both sources talk to the database through [`SqlClient`]; the production
//! client is [`TiberiusClient`].

mod change_tracking;
mod client;
pub mod query;
mod simple;
pub mod table;
mod tiberius_client;

pub use change_tracking::SqlServerChangeTrackingSource;
pub use client::{SqlClient, SqlResultSet};
pub use simple::SqlServerSimpleSource;
pub use table::TableDescription;
pub use tiberius_client::TiberiusClient;
