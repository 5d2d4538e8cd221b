use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use super::types::{RejectReason, Share, Verdict};

pub const DEFAULT_DIFFICULTY: usize = 4;
pub const DEFAULT_MAX_TIME_DRIFT_SECS: u64 = 120;

/// Source of "now" in seconds since the epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Stateless structural checks on a submitted share.
#[derive(Clone)]
pub struct ShareValidator {
    max_time_drift_secs: u64,
    clock: Arc<dyn Clock>,
}

impl Default for ShareValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TIME_DRIFT_SECS)
    }
}

impl ShareValidator {
    pub fn new(max_time_drift_secs: u64) -> Self {
        Self::with_clock(max_time_drift_secs, Arc::new(SystemClock))
    }

    pub fn with_clock(max_time_drift_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_time_drift_secs,
            clock,
        }
    }

    pub fn max_time_drift_secs(&self) -> u64 {
        self.max_time_drift_secs
    }

    pub fn validate_value(&self, value: &Value, difficulty: usize) -> Verdict {
        match Share::from_value(value) {
            Ok(share) => self.validate(&share, difficulty),
            Err(reason) => Verdict::Rejected(reason),
        }
    }

    /// Checks fields, clock drift and hash difficulty, stopping at the
    /// first failure.
    pub fn validate(&self, share: &Share, difficulty: usize) -> Verdict {
        if !fields_are_valid(share) {
            return Verdict::Rejected(RejectReason::MissingOrInvalidFields);
        }

        if let Err(reason) = self.check_drift(share) {
            return Verdict::Rejected(reason);
        }

        if !meets_difficulty(share, difficulty) {
            debug!("Share hash below difficulty {}", difficulty);
            return Verdict::Rejected(RejectReason::InsufficientDifficulty {
                required: difficulty,
            });
        }

        Verdict::Accepted
    }

    fn check_drift(&self, share: &Share) -> Result<(), RejectReason> {
        let drift = share.timestamp().map(|ts| (self.clock.now() - ts).abs());
        match drift {
            Some(drift) if drift <= self.max_time_drift_secs as f64 => Ok(()),
            drift_secs => Err(RejectReason::TimestampDrift {
                drift_secs,
                max_drift_secs: self.max_time_drift_secs,
            }),
        }
    }
}

fn fields_are_valid(share: &Share) -> bool {
    [&share.worker_id, &share.hash, &share.nonce, &share.timestamp]
        .iter()
        .all(|field| field.as_ref().is_some_and(|value| value.is_scalar()))
}

fn meets_difficulty(share: &Share, difficulty: usize) -> bool {
    match share.hash() {
        Some(hash) => hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0'),
        None => false,
    }
}
