//! # Tributary TX - Transforms and Stage Composition
//!
//! Sources emit one element per demand signal; sinks consume groups. This
//! crate holds the stages in between and the wiring that connects them:
//!
//! - [`grouping::GroupedWithin`] groups elements by count or elapsed time
//! - [`validation::SchemaValidation`] checks each row group against a
//!   [`tributary_core::SchemaValidator`]
//! - [`pipeline::connect`] joins a [`pipeline::SchemaBoundSource`] to a
//!   [`pipeline::SchemaBoundSink`] carrying the same validator type, and
//!   [`pipeline::Pipeline`] wires schema-free element streams such as JSON

pub mod grouping;
pub mod pipeline;
pub mod validation;

pub use grouping::{GroupedWithin, GroupingSettings};
pub use pipeline::{
    connect, BoundPipeline, Pipeline, SchemaBoundSink, SchemaBoundSource, DEFAULT_CHANNEL_CAPACITY,
};
pub use validation::SchemaValidation;
