use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::policy::{FraudPolicy, NONCE_STD_DEV_FLOOR};
use super::report::{FraudReport, ReportSink};
use crate::error::{Result, ShareGuardError};
use crate::metrics::FRAUD_REPORTS;
use crate::shares::{Clock, IdentityKey, RejectReason, Share, SystemClock, Verdict};

/// Fewest nonces a window needs before its spread is judged. The mean is
/// judged from the first entry.
const MIN_SPREAD_SAMPLES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowEntry {
    pub timestamp: f64,
    pub nonce: i128,
}

/// Entries for one identity in arrival order. `retired` is set when the
/// key is evicted so that a writer holding a stale handle starts over.
#[derive(Debug, Default)]
struct Window {
    entries: VecDeque<WindowEntry>,
    retired: bool,
}

impl Window {
    fn newest_timestamp(&self) -> Option<f64> {
        self.entries.iter().map(|e| e.timestamp).reduce(f64::max)
    }
}

/// Sliding-window fraud heuristics keyed by worker and origin.
///
/// One instance must be shared by every caller: the window history lives
/// here, so a detector built per share sees nothing but that share.
pub struct FraudDetector {
    policy: FraudPolicy,
    cache: RwLock<HashMap<IdentityKey, Arc<Mutex<Window>>>>,
    sink: Option<Arc<dyn ReportSink>>,
    clock: Arc<dyn Clock>,
}

impl FraudDetector {
    pub fn new(policy: FraudPolicy) -> Result<Self> {
        policy.check()?;
        Ok(Self {
            policy,
            cache: RwLock::new(HashMap::new()),
            sink: None,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &FraudPolicy {
        &self.policy
    }

    pub async fn analyze(&self, share: &Share) -> Verdict {
        let Some((key, entry)) = admit(share) else {
            return Verdict::Unrecorded;
        };

        let verdict = loop {
            let window = self.window_for(&key).await;
            let mut window = window.lock().await;
            if window.retired {
                continue;
            }
            break self.record(&mut window, entry);
        };

        self.finish(share, verdict).await
    }

    /// Like [`analyze`](Self::analyze), but leaves the window untouched and
    /// returns [`ShareGuardError::Cancelled`] once `cancel` has fired.
    pub async fn analyze_cancellable(&self, share: &Share, cancel: &CancellationToken) -> Result<Verdict> {
        let Some((key, entry)) = admit(share) else {
            return Ok(Verdict::Unrecorded);
        };

        if cancel.is_cancelled() {
            debug!("Fraud analysis for {} cancelled before lookup", key);
            return Err(ShareGuardError::Cancelled);
        }

        let verdict = loop {
            let window = self.window_for(&key).await;
            let mut window = window.lock().await;
            if cancel.is_cancelled() {
                debug!("Fraud analysis for {} cancelled before recording", key);
                return Err(ShareGuardError::Cancelled);
            }
            if window.retired {
                continue;
            }
            break self.record(&mut window, entry);
        };

        Ok(self.finish(share, verdict).await)
    }

    /// Drops identities whose newest entry fell out of the window relative
    /// to `now`. Returns how many keys were removed.
    pub async fn prune_idle(&self, now: f64) -> usize {
        let min_ts = now - self.policy.window_seconds as f64;
        let mut cache = self.cache.write().await;
        let before = cache.len();

        cache.retain(|_, window| {
            // A window that is locked is in use right now.
            let Ok(mut window) = window.try_lock() else {
                return true;
            };
            let idle = window.newest_timestamp().map_or(true, |ts| ts < min_ts);
            if idle {
                window.retired = true;
            }
            !idle
        });

        let removed = before - cache.len();
        if removed > 0 {
            debug!("Pruned {} idle identities ({} remaining)", removed, cache.len());
        }
        removed
    }

    pub async fn tracked_identities(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn window_len(&self, key: &IdentityKey) -> usize {
        let window = self.cache.read().await.get(key).cloned();
        match window {
            Some(window) => window.lock().await.entries.len(),
            None => 0,
        }
    }

    async fn window_for(&self, key: &IdentityKey) -> Arc<Mutex<Window>> {
        if let Some(window) = self.cache.read().await.get(key) {
            return window.clone();
        }
        self.cache
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn record(&self, window: &mut Window, entry: WindowEntry) -> Verdict {
        window.entries.push_back(entry);

        // Pruning is relative to the share just recorded, not to the
        // newest timestamp seen, since timestamps come from the client.
        let min_ts = entry.timestamp - self.policy.window_seconds as f64;
        window.entries.retain(|e| e.timestamp >= min_ts);

        let count = window.entries.len();
        if count > self.policy.max_shares {
            return Verdict::Rejected(RejectReason::ExcessiveShareFrequency {
                count,
                max_shares: self.policy.max_shares,
            });
        }

        if let Some((mean, std_dev)) = nonce_stats(&window.entries) {
            let too_uniform = count >= MIN_SPREAD_SAMPLES && std_dev < NONCE_STD_DEV_FLOOR;
            if mean < self.policy.min_avg_nonce || too_uniform {
                return Verdict::Rejected(RejectReason::SuspiciousNonceUniformity { mean, std_dev });
            }
        }

        Verdict::Accepted
    }

    async fn finish(&self, share: &Share, verdict: Verdict) -> Verdict {
        if let Some(reason) = verdict.reject_reason() {
            warn!("Fraud detected ({}): {:?}", reason, share);
            FRAUD_REPORTS.inc();
            self.report(share, reason).await;
        }
        verdict
    }

    async fn report(&self, share: &Share, reason: &RejectReason) {
        let Some(sink) = &self.sink else {
            return;
        };
        let report = FraudReport {
            reason: reason.to_string(),
            share: share.clone(),
            ts: self.clock.now(),
        };
        if let Err(e) = sink.append(&report).await {
            error!("Failed to persist fraud report: {}", e);
        }
    }
}

fn admit(share: &Share) -> Option<(IdentityKey, WindowEntry)> {
    let key = share.identity_key();
    let nonce = share.nonce();
    let timestamp = share.timestamp().filter(|ts| ts.is_finite());

    match (key, nonce, timestamp) {
        (Some(key), Some(nonce), Some(timestamp)) => Some((key, WindowEntry { timestamp, nonce })),
        _ => {
            warn!("Malformed share ignored: {:?}", share);
            None
        }
    }
}

/// Mean and population standard deviation of the window's nonces.
fn nonce_stats(entries: &VecDeque<WindowEntry>) -> Option<(f64, f64)> {
    if entries.is_empty() {
        return None;
    }
    let n = entries.len() as f64;
    let mean = entries.iter().map(|e| e.nonce as f64).sum::<f64>() / n;
    let variance = entries
        .iter()
        .map(|e| (e.nonce as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    Some((mean, variance.sqrt()))
}
