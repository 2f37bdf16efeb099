//! SafeHaven alert automation.
//!
//! Weather and seismic readings flow through a small pipeline:
//! [`ReadingIngester`] validates and queues them, [`RuleEvaluator`] picks the
//! single most severe matching rule, the [`Deduplicator`] suppresses repeats
//! for the same rule and area inside a cooldown window, and [`AlertEmitter`]
//! records a fired alert plus one automation log entry per evaluation.
//! Rules are administered through [`RuleStore`].

pub mod app;
pub mod config;
pub mod dedup;
pub mod emitter;
pub mod error;
pub mod evaluator;
pub mod feed;
pub mod ingest;
pub mod models;
pub mod routes;
pub mod rule_store;
pub mod schema;
pub mod seed;
pub mod store;

pub use config::Config;
pub use dedup::Deduplicator;
pub use emitter::AlertEmitter;
pub use evaluator::RuleEvaluator;
pub use ingest::ReadingIngester;
pub use rule_store::RuleStore;
