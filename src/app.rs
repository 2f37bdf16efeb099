//! Wires a storage [`Backend`] and a [`Config`] into the running pipeline.

use std::sync::Arc;

use crate::config::Config;
use crate::dedup::{Deduplicator, LocationGrid};
use crate::emitter::AlertEmitter;
use crate::evaluator::RuleEvaluator;
use crate::ingest::{IngesterHandle, Pipeline, ReadingIngester};
use crate::rule_store::RuleStore;
use crate::store::{AlertRepository, Backend};

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub rules: RuleStore,
    pub ingester: ReadingIngester,
    pub alerts: Arc<dyn AlertRepository>,
    pub config: Config,
}

/// Build the pipeline and start the ingest dispatcher.
///
/// Must be called from within a Tokio runtime.
pub fn assemble(backend: Backend, config: Config) -> (AppState, IngesterHandle) {
    // ---
    let timeout = config.persist_timeout();
    let rules = RuleStore::new(backend.rules.clone(), timeout);

    let dedup = Deduplicator::new(
        backend.cooldowns.clone(),
        LocationGrid::new(config.location_grid_km),
        config.default_cooldown(),
        timeout,
    );
    let pipeline = Pipeline::new(
        RuleEvaluator::new(rules.clone(), config.rule_tie_break),
        AlertEmitter::new(backend.alerts.clone(), dedup, timeout),
    );

    let (ingester, handle) = ReadingIngester::spawn(
        pipeline,
        config.ingest_queue_capacity as usize,
        config.ingest_workers as usize,
    );

    let state = AppState {
        rules,
        ingester,
        alerts: backend.alerts,
        config,
    };
    (state, handle)
}
