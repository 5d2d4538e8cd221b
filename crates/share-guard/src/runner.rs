use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, ShareGuardError};
use crate::fraud::FraudDetector;
use crate::metrics::{
    SHARES_ACCEPTED, SHARES_REJECTED, SHARES_SUBMITTED, STAGE_DURATION, VALIDATION_ERRORS,
};
use crate::shares::{RejectReason, Share, ShareValidator, Verdict};

pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Validator,
    Fraud,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validator => "validator",
            Stage::Fraud => "fraud",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two checks a share goes through, in order.
#[async_trait::async_trait]
pub trait ShareStages: Send + Sync {
    async fn validate(&self, share: &Share) -> Result<Verdict>;

    /// Must not touch shared state once `cancel` has fired.
    async fn analyze_fraud(&self, share: &Share, cancel: &CancellationToken) -> Result<Verdict>;
}

/// Structural validation followed by the shared fraud detector.
pub struct PoolStages {
    validator: ShareValidator,
    difficulty: usize,
    detector: Arc<FraudDetector>,
}

impl PoolStages {
    pub fn new(validator: ShareValidator, difficulty: usize, detector: Arc<FraudDetector>) -> Self {
        Self {
            validator,
            difficulty,
            detector,
        }
    }

    pub fn detector(&self) -> &Arc<FraudDetector> {
        &self.detector
    }
}

#[async_trait::async_trait]
impl ShareStages for PoolStages {
    async fn validate(&self, share: &Share) -> Result<Verdict> {
        Ok(self.validator.validate(share, self.difficulty))
    }

    async fn analyze_fraud(&self, share: &Share, cancel: &CancellationToken) -> Result<Verdict> {
        self.detector.analyze_cancellable(share, cancel).await
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub stage_timeout: Duration,
    pub workers: usize,
    /// Skip fraud analysis (and recording) for shares the validator rejected.
    pub skip_fraud_on_invalid: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            workers: DEFAULT_WORKERS,
            skip_fraud_on_invalid: false,
        }
    }
}

impl RunnerConfig {
    pub fn check(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ShareGuardError::Configuration(
                "runner needs at least one worker".to_string(),
            ));
        }
        if self.stage_timeout.is_zero() {
            return Err(ShareGuardError::Configuration(
                "stage timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Accepted,
    Rejected,
    Error,
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionStatus::Accepted => write!(f, "accepted"),
            DecisionStatus::Rejected => write!(f, "rejected"),
            DecisionStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionReason {
    Rejected { stage: Stage, reason: RejectReason },
    Timeout { stage: Stage, budget: Duration },
    StageFailed { stage: Stage, message: String },
}

impl DecisionReason {
    pub fn stage(&self) -> Stage {
        match self {
            DecisionReason::Rejected { stage, .. }
            | DecisionReason::Timeout { stage, .. }
            | DecisionReason::StageFailed { stage, .. } => *stage,
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionReason::Rejected { reason, .. } => reason.fmt(f),
            DecisionReason::Timeout { stage, budget } => write!(
                f,
                "[TIMEOUT] Stage '{}' exceeded {}s",
                stage,
                budget.as_secs_f64()
            ),
            DecisionReason::StageFailed { stage, message } => {
                write!(f, "[RUNTIME] Stage '{}' failed: {}", stage, message)
            }
        }
    }
}

impl Serialize for DecisionReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageTiming {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fraud_check_ms: Option<u64>,
}

/// Everything decided about one share.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub status: DecisionStatus,
    pub reason: Option<DecisionReason>,
    pub basic_valid: Option<bool>,
    /// `true` when the fraud check passed.
    #[serde(rename = "fraud_detected")]
    pub fraud_check_passed: Option<bool>,
    pub timing: StageTiming,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Validating,
    FraudChecking,
    Decided,
    Errored,
}

struct ValidationContext {
    id: Uuid,
    started: Instant,
    phase: Phase,
    basic_valid: Option<bool>,
    fraud_check_passed: Option<bool>,
    timing: StageTiming,
    reason: Option<DecisionReason>,
}

impl ValidationContext {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started: Instant::now(),
            phase: Phase::Start,
            basic_valid: None,
            fraud_check_passed: None,
            timing: StageTiming::default(),
            reason: None,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!(id = %self.id, from = ?self.phase, to = ?phase, "validation phase");
        self.phase = phase;
    }

    fn fail(mut self, reason: DecisionReason) -> DecisionRecord {
        self.enter(Phase::Errored);
        self.reason = Some(reason);
        self.into_record(DecisionStatus::Error)
    }

    fn decide(mut self, status: DecisionStatus, reason: Option<DecisionReason>) -> DecisionRecord {
        self.enter(Phase::Decided);
        self.reason = reason;
        self.into_record(status)
    }

    fn into_record(self, status: DecisionStatus) -> DecisionRecord {
        DecisionRecord {
            id: self.id,
            status,
            reason: self.reason,
            basic_valid: self.basic_valid,
            fraud_check_passed: self.fraud_check_passed,
            timing: self.timing,
            duration_ms: millis(self.started.elapsed()),
        }
    }
}

macro_rules! audit {
    ($level:ident, $record:expr, $reason:expr) => {
        tracing::$level!(
            target: "share_guard::audit",
            id = %$record.id,
            status = %$record.status,
            duration_ms = $record.duration_ms,
            validation_ms = ?$record.timing.validation_ms,
            fraud_check_ms = ?$record.timing.fraud_check_ms,
            basic_valid = ?$record.basic_valid,
            fraud_detected = ?$record.fraud_check_passed,
            reason = ?$reason,
            "validation decision"
        )
    };
}

/// Runs each share through the validator and the fraud detector, each
/// bounded by its own time budget, on a fixed-size pool of workers.
pub struct ValidationRunner {
    stages: Arc<dyn ShareStages>,
    config: RunnerConfig,
    pool: Arc<Semaphore>,
}

impl ValidationRunner {
    pub fn new(stages: Arc<dyn ShareStages>, config: RunnerConfig) -> Result<Self> {
        config.check()?;
        let pool = Arc::new(Semaphore::new(config.workers));
        Ok(Self {
            stages,
            config,
            pool,
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Decides a raw JSON record. Anything other than an object is
    /// rejected without running either stage.
    pub async fn validate_json(&self, value: Value) -> DecisionRecord {
        match Share::from_value(&value) {
            Ok(share) => self.validate(share).await,
            Err(reason) => {
                SHARES_SUBMITTED.inc();
                let mut ctx = ValidationContext::new();
                ctx.basic_valid = Some(false);
                let reason = DecisionReason::Rejected {
                    stage: Stage::Validator,
                    reason,
                };
                conclude(ctx.decide(DecisionStatus::Rejected, Some(reason)))
            }
        }
    }

    pub async fn validate(&self, share: Share) -> DecisionRecord {
        SHARES_SUBMITTED.inc();
        let share = Arc::new(share);
        let mut ctx = ValidationContext::new();

        ctx.enter(Phase::Validating);
        let stages = self.stages.clone();
        let input = share.clone();
        let (outcome, elapsed) = self
            .run_stage(Stage::Validator, move |_| async move {
                stages.validate(&input).await
            })
            .await;
        ctx.timing.validation_ms = Some(millis(elapsed));
        let basic = match outcome {
            Ok(verdict) => verdict,
            Err(reason) => return conclude(ctx.fail(reason)),
        };
        ctx.basic_valid = Some(basic.is_valid());

        let fraud = if self.config.skip_fraud_on_invalid && !basic.is_valid() {
            None
        } else {
            ctx.enter(Phase::FraudChecking);
            let stages = self.stages.clone();
            let input = share.clone();
            let (outcome, elapsed) = self
                .run_stage(Stage::Fraud, move |cancel| async move {
                    stages.analyze_fraud(&input, &cancel).await
                })
                .await;
            ctx.timing.fraud_check_ms = Some(millis(elapsed));
            match outcome {
                Ok(verdict) => {
                    ctx.fraud_check_passed = Some(verdict.is_valid());
                    Some(verdict)
                }
                Err(reason) => return conclude(ctx.fail(reason)),
            }
        };

        let reason = match (&basic, &fraud) {
            (Verdict::Rejected(reason), _) => Some(DecisionReason::Rejected {
                stage: Stage::Validator,
                reason: reason.clone(),
            }),
            (_, Some(Verdict::Rejected(reason))) => Some(DecisionReason::Rejected {
                stage: Stage::Fraud,
                reason: reason.clone(),
            }),
            _ => None,
        };
        let status = if reason.is_none() && fraud.is_some() {
            DecisionStatus::Accepted
        } else {
            DecisionStatus::Rejected
        };

        conclude(ctx.decide(status, reason))
    }

    /// Runs one stage on the worker pool. Waiting for a free worker counts
    /// against the stage budget; on expiry the stage is cancelled and its
    /// task aborted.
    async fn run_stage<F, Fut>(
        &self,
        stage: Stage,
        work: F,
    ) -> (std::result::Result<Verdict, DecisionReason>, Duration)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Verdict>> + Send + 'static,
    {
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let pool = self.pool.clone();
        let work = work(cancel.clone());

        let mut handle = tokio::spawn(async move {
            let _permit = pool
                .acquire_owned()
                .await
                .map_err(|_| ShareGuardError::WorkerPoolClosed)?;
            work.await
        });

        let budget = self.config.stage_timeout;
        let outcome = match timeout(budget, &mut handle).await {
            Ok(Ok(Ok(verdict))) => Ok(verdict),
            Ok(Ok(Err(e))) => Err(DecisionReason::StageFailed {
                stage,
                message: e.to_string(),
            }),
            Ok(Err(join_error)) => Err(DecisionReason::StageFailed {
                stage,
                message: join_error.to_string(),
            }),
            Err(_) => {
                cancel.cancel();
                handle.abort();
                warn!("Stage {} exceeded its {:?} budget and was cancelled", stage, budget);
                Err(DecisionReason::Timeout { stage, budget })
            }
        };

        let elapsed = started.elapsed();
        STAGE_DURATION
            .with_label_values(&[stage.as_str()])
            .observe(elapsed.as_secs_f64());
        (outcome, elapsed)
    }
}

fn conclude(record: DecisionRecord) -> DecisionRecord {
    let reason = record.reason.as_ref().map(ToString::to_string);
    match record.status {
        DecisionStatus::Accepted => {
            SHARES_ACCEPTED.inc();
            audit!(info, record, reason);
        }
        DecisionStatus::Rejected => {
            SHARES_REJECTED.inc();
            audit!(info, record, reason);
        }
        DecisionStatus::Error => {
            VALIDATION_ERRORS.inc();
            audit!(error, record, reason);
        }
    }
    record
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fraud::FraudPolicy;
    use crate::shares::validator::tests::FixedClock;
    use crate::shares::IdentityKey;
    use serde_json::json;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    const NOW: f64 = 1_700_000_000.0;

    fn pool_stages(max_shares: usize) -> Arc<PoolStages> {
        let validator = ShareValidator::with_clock(120, Arc::new(FixedClock(NOW)));
        let policy = FraudPolicy {
            max_shares,
            ..Default::default()
        };
        let detector = Arc::new(FraudDetector::new(policy).unwrap());
        Arc::new(PoolStages::new(validator, 4, detector))
    }

    fn runner(stages: Arc<dyn ShareStages>, config: RunnerConfig) -> ValidationRunner {
        ValidationRunner::new(stages, config).unwrap()
    }

    fn good_share() -> Share {
        Share::new("w1", "1.2.3.4", "0000abc123", 123_456, NOW)
    }

    /// Stages with configurable delays and failures.
    #[derive(Default)]
    struct ScriptedStages {
        validate_delay: Duration,
        fraud_delay: Duration,
        fail_in: Option<Stage>,
        panic_in: Option<Stage>,
        fraud_cancel: Mutex<Option<CancellationToken>>,
    }

    impl ScriptedStages {
        async fn step(&self, stage: Stage, delay: Duration) -> Result<Verdict> {
            tokio::time::sleep(delay).await;
            if self.panic_in == Some(stage) {
                panic!("stage {} blew up", stage);
            }
            if self.fail_in == Some(stage) {
                return Err(ShareGuardError::Stage("boom".to_string()));
            }
            Ok(Verdict::Accepted)
        }
    }

    #[async_trait::async_trait]
    impl ShareStages for ScriptedStages {
        async fn validate(&self, _share: &Share) -> Result<Verdict> {
            self.step(Stage::Validator, self.validate_delay).await
        }

        async fn analyze_fraud(&self, _share: &Share, cancel: &CancellationToken) -> Result<Verdict> {
            *self.fraud_cancel.lock().unwrap() = Some(cancel.clone());
            self.step(Stage::Fraud, self.fraud_delay).await
        }
    }

    #[tokio::test]
    async fn test_valid_share_is_accepted() {
        let runner = runner(pool_stages(200), RunnerConfig::default());
        let record = runner.validate(good_share()).await;

        assert_eq!(record.status, DecisionStatus::Accepted);
        assert_eq!(record.reason, None);
        assert_eq!(record.basic_valid, Some(true));
        assert_eq!(record.fraud_check_passed, Some(true));
        assert!(record.timing.validation_ms.is_some());
        assert!(record.timing.fraud_check_ms.is_some());
    }

    #[tokio::test]
    async fn test_invalid_hash_still_runs_fraud_stage() {
        let stages = pool_stages(200);
        let runner = runner(stages.clone(), RunnerConfig::default());
        let mut share = good_share();
        share.hash = Some("abc123".into());

        let record = runner.validate(share).await;
        assert_eq!(record.status, DecisionStatus::Rejected);
        assert_eq!(record.basic_valid, Some(false));
        assert_eq!(record.fraud_check_passed, Some(true));
        assert_eq!(
            record.reason,
            Some(DecisionReason::Rejected {
                stage: Stage::Validator,
                reason: RejectReason::InsufficientDifficulty { required: 4 },
            })
        );
        assert_eq!(stages.detector().window_len(&IdentityKey::new("w1", "1.2.3.4")).await, 1);
    }

    #[tokio::test]
    async fn test_skip_fraud_on_invalid_leaves_detector_untouched() {
        let stages = pool_stages(200);
        let config = RunnerConfig {
            skip_fraud_on_invalid: true,
            ..Default::default()
        };
        let runner = runner(stages.clone(), config);
        let mut share = good_share();
        share.hash = Some("abc123".into());

        let record = runner.validate(share).await;
        assert_eq!(record.status, DecisionStatus::Rejected);
        assert_eq!(record.fraud_check_passed, None);
        assert_eq!(record.timing.fraud_check_ms, None);
        assert_eq!(stages.detector().tracked_identities().await, 0);
    }

    #[tokio::test]
    async fn test_fraud_rejection_reason_comes_from_fraud_stage() {
        let runner = runner(pool_stages(1), RunnerConfig::default());
        let first = runner.validate(good_share()).await;
        assert_eq!(first.status, DecisionStatus::Accepted);

        let mut second = good_share();
        second.nonce = Some(9_999_999i64.into());
        let record = runner.validate(second).await;
        assert_eq!(record.status, DecisionStatus::Rejected);
        assert_eq!(record.basic_valid, Some(true));
        assert_eq!(record.fraud_check_passed, Some(false));
        assert_eq!(record.reason.as_ref().map(DecisionReason::stage), Some(Stage::Fraud));
        assert_eq!(
            record.reason.map(|r| r.to_string()).as_deref(),
            Some("Excessive share frequency.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_validator_timeout_is_an_error() {
        let stages = Arc::new(ScriptedStages {
            validate_delay: Duration::from_secs(3600),
            ..Default::default()
        });
        let runner = runner(stages.clone(), RunnerConfig::default());

        let record = runner.validate(good_share()).await;
        assert_eq!(record.status, DecisionStatus::Error);
        assert_eq!(record.basic_valid, None);
        assert_eq!(record.fraud_check_passed, None);
        assert_eq!(
            record.reason.map(|r| r.to_string()).as_deref(),
            Some("[TIMEOUT] Stage 'validator' exceeded 3s")
        );
        assert!(stages.fraud_cancel.lock().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fraud_timeout_cancels_the_stage() {
        let stages = Arc::new(ScriptedStages {
            fraud_delay: Duration::from_secs(3600),
            ..Default::default()
        });
        let runner = runner(stages.clone(), RunnerConfig::default());

        let record = runner.validate(good_share()).await;
        assert_eq!(record.status, DecisionStatus::Error);
        assert_eq!(record.basic_valid, Some(true));
        assert_eq!(
            record.reason,
            Some(DecisionReason::Timeout {
                stage: Stage::Fraud,
                budget: DEFAULT_STAGE_TIMEOUT,
            })
        );
        let cancel = stages.fraud_cancel.lock().unwrap().clone().unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_stage_failure_is_classified() {
        let stages = Arc::new(ScriptedStages {
            fail_in: Some(Stage::Validator),
            ..Default::default()
        });
        let record = runner(stages, RunnerConfig::default()).validate(good_share()).await;
        assert_eq!(record.status, DecisionStatus::Error);
        assert_eq!(
            record.reason.map(|r| r.to_string()).as_deref(),
            Some("[RUNTIME] Stage 'validator' failed: boom")
        );
    }

    #[tokio::test]
    async fn test_stage_panic_is_classified() {
        let stages = Arc::new(ScriptedStages {
            panic_in: Some(Stage::Fraud),
            ..Default::default()
        });
        let record = runner(stages, RunnerConfig::default()).validate(good_share()).await;
        assert_eq!(record.status, DecisionStatus::Error);
        assert!(matches!(
            record.reason,
            Some(DecisionReason::StageFailed { stage: Stage::Fraud, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queueing_counts_against_the_budget() {
        let stages = Arc::new(ScriptedStages {
            validate_delay: Duration::from_secs(2),
            ..Default::default()
        });
        let config = RunnerConfig {
            workers: 1,
            ..Default::default()
        };
        let runner = runner(stages, config);

        let (first, second) = tokio::join!(runner.validate(good_share()), runner.validate(good_share()));
        assert_eq!(first.status, DecisionStatus::Accepted);
        assert_eq!(second.status, DecisionStatus::Error);
        assert!(matches!(
            second.reason,
            Some(DecisionReason::Timeout { stage: Stage::Validator, .. })
        ));
    }

    #[tokio::test]
    async fn test_non_object_input_is_rejected() {
        let stages = pool_stages(200);
        let runner = runner(stages.clone(), RunnerConfig::default());

        let record = runner.validate_json(json!("not a share")).await;
        assert_eq!(record.status, DecisionStatus::Rejected);
        assert_eq!(
            record.reason.as_ref().map(|r| r.to_string()).as_deref(),
            Some("Expected input of type dict.")
        );
        assert_eq!(record.basic_valid, Some(false));
        assert_eq!(record.fraud_check_passed, None);
        assert_eq!(stages.detector().tracked_identities().await, 0);
    }

    #[tokio::test]
    async fn test_decision_record_wire_shape() {
        let runner = runner(pool_stages(200), RunnerConfig::default());
        let mut share = good_share();
        share.worker_id = None;

        let record = runner.validate(share).await;
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "Missing or invalid fields.");
        assert_eq!(json["basic_valid"], false);
        assert_eq!(json["fraud_detected"], true);
        assert!(json["timing"]["validation_ms"].is_u64());
        assert!(json["timing"]["fraud_check_ms"].is_u64());
        assert!(json["duration_ms"].is_u64());
        assert!(Uuid::parse_str(json["id"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_rejects_degenerate_config() {
        let zero_workers = RunnerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(ValidationRunner::new(pool_stages(1), zero_workers).is_err());

        let zero_timeout = RunnerConfig {
            stage_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_timeout.check().is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_every_call_emits_one_audit_line() {
        let runner = runner(pool_stages(200), RunnerConfig::default());
        let record = runner.validate(good_share()).await;

        let id = record.id.to_string();
        logs_assert(|lines: &[&str]| {
            let audits = lines
                .iter()
                .filter(|line| line.contains("validation decision") && line.contains(id.as_str()))
                .count();
            match audits {
                1 => Ok(()),
                n => Err(format!("expected one audit line, found {}", n)),
            }
        });
        assert!(logs_contain("status=accepted"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_errors_are_audited() {
        let stages = Arc::new(ScriptedStages {
            fail_in: Some(Stage::Fraud),
            ..Default::default()
        });
        runner(stages, RunnerConfig::default()).validate(good_share()).await;
        assert!(logs_contain("status=error"));
        assert!(logs_contain("[RUNTIME] Stage 'fraud' failed: boom"));
    }
}
