//! Reading intake and the evaluation worker loop.
//!
//! [`ReadingIngester::ingest`] validates a reading and queues it without
//! waiting on storage. A dispatcher task drains the queue and runs each
//! reading through the [`Pipeline`] on its own task, with at most
//! `workers` evaluations in flight.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::emitter::AlertEmitter;
use crate::error::{IngestError, InvalidReadingError, PersistenceError};
use crate::evaluator::RuleEvaluator;
use crate::models::{Decision, FiredAlert, RawReading, Reading, Severity};

// ---

/// Outcome of running one reading through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub decision: Decision,
    pub rule_id: Option<i64>,
    pub severity: Option<Severity>,
    pub alert: Option<FiredAlert>,
}

/// Evaluate then emit. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    evaluator: Arc<RuleEvaluator>,
    emitter: Arc<AlertEmitter>,
}

impl Pipeline {
    // ---
    pub fn new(evaluator: RuleEvaluator, emitter: AlertEmitter) -> Self {
        Self {
            evaluator: Arc::new(evaluator),
            emitter: Arc::new(emitter),
        }
    }

    pub async fn process(&self, reading: &Reading) -> Result<ProcessOutcome, PersistenceError> {
        self.process_at(reading, Utc::now()).await
    }

    /// Run `reading` through evaluation and emission as of `now`.
    pub async fn process_at(
        &self,
        reading: &Reading,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, PersistenceError> {
        // ---
        let result = self.evaluator.evaluate(reading).await?;
        let emission = self.emitter.emit(&result, reading, now).await?;

        Ok(ProcessOutcome {
            decision: emission.decision,
            rule_id: result.matched_rule.as_ref().map(|r| r.id),
            severity: result.severity,
            alert: emission.alert,
        })
    }
}

/// Handle to the background dispatcher.
pub struct IngesterHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IngesterHandle {
    /// Stop taking new readings and wait for in-flight evaluations to finish.
    pub async fn shutdown(self) {
        // ---
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Ingest dispatcher terminated abnormally");
        }
    }
}

#[derive(Clone)]
pub struct ReadingIngester {
    tx: mpsc::Sender<Reading>,
    pipeline: Pipeline,
}

impl ReadingIngester {
    // ---
    /// Start the dispatcher on the current runtime.
    pub fn spawn(pipeline: Pipeline, capacity: usize, workers: usize) -> (Self, IngesterHandle) {
        // ---
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_dispatcher(
            pipeline.clone(),
            rx,
            shutdown_rx,
            workers.max(1),
        ));

        (
            Self { tx, pipeline },
            IngesterHandle {
                shutdown: shutdown_tx,
                task,
            },
        )
    }

    /// Validate a raw reading. Invalid readings are logged and returned as errors.
    pub fn validate(&self, raw: &RawReading) -> Result<Reading, InvalidReadingError> {
        raw.to_reading().inspect_err(|e| {
            tracing::warn!(metric = %raw.metric_type, value = raw.value, error = %e, "Dropping invalid reading");
        })
    }

    /// Validate and queue a reading for background evaluation.
    pub fn ingest(&self, raw: &RawReading) -> Result<(), IngestError> {
        // ---
        let reading = self.validate(raw)?;
        self.tx.try_send(reading).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!("Ingest queue full, rejecting reading");
                IngestError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => IngestError::ShuttingDown,
        })
    }

    /// Validate and evaluate inline, returning the outcome.
    pub async fn process(&self, raw: &RawReading) -> Result<ProcessOutcome, ProcessError> {
        // ---
        let reading = self.validate(raw)?;
        Ok(self.pipeline.process(&reading).await?)
    }
}

/// Failure of the inline processing path.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Invalid(#[from] InvalidReadingError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

async fn run_dispatcher(
    pipeline: Pipeline,
    mut rx: mpsc::Receiver<Reading>,
    mut shutdown: watch::Receiver<bool>,
    workers: usize,
) {
    // ---
    let limit = Arc::new(Semaphore::new(workers));
    tracing::info!(workers, "Ingest dispatcher started");

    loop {
        let reading = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = rx.recv() => match next {
                Some(reading) => reading,
                None => break,
            },
        };

        let Ok(permit) = limit.clone().acquire_owned().await else {
            break;
        };
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = pipeline.process(&reading).await {
                tracing::error!(
                    metric = %reading.metric_type,
                    value = reading.value,
                    error = %e,
                    "Failed to process reading"
                );
            }
        });
    }

    rx.close();
    let dropped = rx.len();
    if dropped > 0 {
        tracing::warn!(dropped, "Discarding queued readings on shutdown");
    }

    // Every permit back means every spawned evaluation has finished
    let _ = limit.acquire_many(workers as u32).await;
    tracing::info!("Ingest dispatcher stopped");
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::dedup::{Deduplicator, LocationGrid};
    use crate::evaluator::TieBreak;
    use crate::rule_store::RuleStore;
    use crate::seed::seed_default_rules;
    use crate::store::memory::MemoryStore;
    use crate::store::{AlertRepository, LogFilter};
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;
    use tokio_test::assert_ok;

    async fn pipeline(store: Arc<MemoryStore>) -> Pipeline {
        // ---
        let timeout = StdDuration::from_secs(1);
        let rules = RuleStore::new(store.clone(), timeout);
        seed_default_rules(&rules).await.unwrap();

        let dedup = Deduplicator::new(
            store.clone(),
            LocationGrid::new(10.0),
            Duration::minutes(60),
            timeout,
        );
        Pipeline::new(
            RuleEvaluator::new(rules, TieBreak::default()),
            AlertEmitter::new(store, dedup, timeout),
        )
    }

    fn raw(metric: &str, value: f64) -> RawReading {
        // ---
        RawReading {
            metric_type: metric.to_string(),
            value,
            latitude: 14.6,
            longitude: 121.0,
            area: Some("Marikina".to_string()),
            observed_at: Some(Utc.with_ymd_and_hms(2025, 7, 20, 4, 0, 0).unwrap()),
        }
    }

    fn all_logs() -> LogFilter {
        LogFilter {
            decision: None,
            limit: 1000,
        }
    }

    #[tokio::test]
    async fn test_cooldown_cycle() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(store.clone()).await;
        let reading = raw("rainfall_mm", 55.0).to_reading().unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 7, 20, 4, 0, 0).unwrap();

        let first = p.process_at(&reading, t0).await.unwrap();
        let second = p.process_at(&reading, t0 + Duration::minutes(10)).await.unwrap();
        let third = p.process_at(&reading, t0 + Duration::minutes(61)).await.unwrap();

        assert_eq!(first.decision, Decision::Fired);
        assert_eq!(second.decision, Decision::Suppressed);
        assert_eq!(third.decision, Decision::Fired);
        assert_eq!(first.severity, Some(Severity::High));
        assert_eq!(store.list_alerts(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_every_evaluation_logged_once() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(store.clone()).await;
        let t0 = Utc.with_ymd_and_hms(2025, 7, 20, 4, 0, 0).unwrap();

        let readings = [
            raw("rainfall_mm", 12.0),
            raw("rainfall_mm", 80.0),
            raw("rainfall_mm", 81.0),
            raw("earthquake_magnitude", 6.5),
            raw("temperature_c", 39.5),
            raw("wind_kmh", 20.0),
        ];
        for r in &readings {
            let reading = r.to_reading().unwrap();
            assert_ok!(p.process_at(&reading, t0).await);
        }

        let logs = store.list_logs(all_logs()).await.unwrap();
        let alerts = store.list_alerts(100).await.unwrap();
        assert_eq!(logs.len(), readings.len());

        let fired: Vec<_> = logs.iter().filter(|l| l.decision == Decision::Fired).collect();
        assert_eq!(fired.len(), alerts.len());
        for alert in &alerts {
            assert_eq!(
                fired.iter().filter(|l| l.alert_id == Some(alert.id)).count(),
                1
            );
        }
        assert_eq!(
            logs.iter().filter(|l| l.decision == Decision::Suppressed).count(),
            1
        );
        assert_eq!(
            logs.iter().filter(|l| l.decision == Decision::NoMatch).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_fire_once() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(store.clone()).await;
        let reading = raw("earthquake_magnitude", 7.2).to_reading().unwrap();
        let now = Utc::now();

        let (a, b) = tokio::join!(p.process_at(&reading, now), p.process_at(&reading, now));
        let decisions = [a.unwrap().decision, b.unwrap().decision];

        assert_eq!(decisions.iter().filter(|d| **d == Decision::Fired).count(), 1);
        assert_eq!(store.list_alerts(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_reading_rejected_without_log() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let (ingester, handle) = ReadingIngester::spawn(pipeline(store.clone()).await, 8, 2);

        let err = ingester.ingest(&raw("earthquake_magnitude", 12.0)).unwrap_err();
        assert!(matches!(err, IngestError::Invalid(_)));

        handle.shutdown().await;
        assert!(store.list_logs(all_logs()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queued_readings_processed_before_shutdown_completes() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let (ingester, handle) = ReadingIngester::spawn(pipeline(store.clone()).await, 64, 4);

        ingester.ingest(&raw("wind_kmh", 90.0)).unwrap();
        ingester.ingest(&raw("rainfall_mm", 3.0)).unwrap();

        // Wait until both readings have been logged
        for _ in 0..100 {
            if store.list_logs(all_logs()).await.unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(store.list_logs(all_logs()).await.unwrap().len(), 2);
        assert_eq!(store.list_alerts(10).await.unwrap().len(), 1);
        assert!(matches!(
            ingester.ingest(&raw("wind_kmh", 90.0)),
            Err(IngestError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(store).await;
        let (tx, _rx) = mpsc::channel(1);
        let ingester = ReadingIngester { tx, pipeline: p };

        ingester.ingest(&raw("wind_kmh", 10.0)).unwrap();
        assert!(matches!(
            ingester.ingest(&raw("wind_kmh", 10.0)),
            Err(IngestError::QueueFull)
        ));
    }
}
