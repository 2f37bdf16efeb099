//! Cooldown-based suppression of repeated rule matches.
//!
//! Each (rule, location bucket) pair runs a small state machine:
//! `Idle -> Fired(until) -> Idle`, where an expired cooldown counts as idle.
//! The state itself lives in an injected [`CooldownLedger`]. A key only moves
//! to `Fired` in the same store transaction that writes the alert, so the
//! ledger never claims a key for an alert that does not exist.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SubsecRound, Utc};

use crate::error::PersistenceError;
use crate::models::{AutomationLogEntry, FiredAlert, Location, Rule};
use crate::store::{bounded, CooldownLedger};

/// Kilometres per degree of latitude.
const KM_PER_DEGREE: f64 = 111.32;

// ---

/// Coarse grid cell that nearby readings collapse into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocationBucket {
    pub lat_cell: i64,
    pub lon_cell: i64,
}

/// Key of one cooldown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub rule_id: i64,
    pub bucket: LocationBucket,
}

/// Square grid with cells of a fixed size in degrees.
#[derive(Debug, Clone, Copy)]
pub struct LocationGrid {
    cell_degrees: f64,
}

impl LocationGrid {
    // ---
    pub fn new(cell_km: f64) -> Self {
        Self {
            cell_degrees: cell_km / KM_PER_DEGREE,
        }
    }

    pub fn bucket(&self, location: &Location) -> LocationBucket {
        LocationBucket {
            lat_cell: (location.latitude / self.cell_degrees).floor() as i64,
            lon_cell: (location.longitude / self.cell_degrees).floor() as i64,
        }
    }
}

/// Cooldown state of one key as seen at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownState {
    Idle,
    Fired { until: DateTime<Utc> },
}

impl CooldownState {
    pub fn from_expiry(until: Option<DateTime<Utc>>) -> Self {
        match until {
            Some(until) => CooldownState::Fired { until },
            None => CooldownState::Idle,
        }
    }

    pub fn should_suppress(&self, now: DateTime<Utc>) -> bool {
        match self {
            CooldownState::Idle => false,
            CooldownState::Fired { until } => *until > now,
        }
    }
}

/// Cooldown window an alert fired at `now` would open for `key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownClaim {
    pub key: CooldownKey,
    pub now: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

pub struct Deduplicator {
    ledger: Arc<dyn CooldownLedger>,
    grid: LocationGrid,
    default_cooldown: Duration,
    timeout: StdDuration,
}

impl Deduplicator {
    // ---
    pub fn new(
        ledger: Arc<dyn CooldownLedger>,
        grid: LocationGrid,
        default_cooldown: Duration,
        timeout: StdDuration,
    ) -> Self {
        Self {
            ledger,
            grid,
            default_cooldown,
            timeout,
        }
    }

    pub fn cooldown_for(&self, rule: &Rule) -> Duration {
        rule.cooldown_minutes
            .map(|m| Duration::minutes(i64::from(m)))
            .unwrap_or(self.default_cooldown)
    }

    pub fn key_for(&self, rule_id: i64, location: &Location) -> CooldownKey {
        CooldownKey {
            rule_id,
            bucket: self.grid.bucket(location),
        }
    }

    /// Whether an earlier alert for `rule` near `location` is still cooling
    /// down at `now`. Read-only.
    pub async fn should_suppress(
        &self,
        rule: &Rule,
        location: &Location,
        now: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        // ---
        let key = self.key_for(rule.id, location);
        let until = bounded(
            "cooldown lookup",
            self.timeout,
            self.ledger.cooldown_until(&key),
        )
        .await?;

        let suppress = CooldownState::from_expiry(until).should_suppress(now.trunc_subsecs(6));
        if suppress {
            tracing::debug!(
                rule_id = rule.id,
                lat_cell = key.bucket.lat_cell,
                lon_cell = key.bucket.lon_cell,
                "Rule match suppressed (cooldown active)"
            );
        }
        Ok(suppress)
    }

    /// The cooldown an alert for `rule` at `location` fired at `now` opens.
    ///
    /// Timestamps are truncated to microseconds so they compare exactly
    /// against what the database stores.
    pub fn claim_for(&self, rule: &Rule, location: &Location, now: DateTime<Utc>) -> CooldownClaim {
        // ---
        let now = now.trunc_subsecs(6);
        CooldownClaim {
            key: self.key_for(rule.id, location),
            now,
            until: now + self.cooldown_for(rule),
        }
    }

    /// Take `claim` and write `alert` with its `fired` log entry atomically.
    ///
    /// Returns `false`, with nothing written, when another alert for the same
    /// key won the window first. On error nothing is claimed.
    pub async fn try_fire(
        &self,
        claim: &CooldownClaim,
        alert: &FiredAlert,
        entry: &AutomationLogEntry,
    ) -> Result<bool, PersistenceError> {
        // ---
        bounded(
            "persist fired alert",
            self.timeout,
            self.ledger
                .try_fire(&claim.key, claim.now, claim.until, alert, entry),
        )
        .await
    }
}
