//! Salesforce bulk extraction
//!
//! Login uses the OAuth2 password grant through
//! [`crate::rest::DynamicBearerAuth`]. The entity schema comes from
//! `FieldDefinition` metadata and data from Bulk API 2.0 query jobs, whose CSV
//! results are paged by the `Sforce-Locator` header.

mod client;
pub mod entity;
pub mod job;
mod source;

pub use client::SalesforceClient;
pub use job::{BulkJob, JobState};
pub use source::SalesForceSource;
