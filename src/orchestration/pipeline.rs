//! Review, fix and merge of one produced change request.
//!
//! The pipeline is a small state machine:
//!
//! ```text
//! Reviewing -> CheckingMergeable | Fixing | Failed
//! Fixing -> Reviewing | Failed
//! CheckingMergeable -> Merging | ResolvingConflicts | Failed
//! ResolvingConflicts -> CheckingMergeable | Failed
//! Merging -> Landed | Failed
//! ```
//!
//! Every error inside a stage becomes `Failed` with a readable message;
//! [`Pipeline::run`] never returns an error. Cancellation is honoured
//! between stages, never inside one, so collaborators always get to clean
//! up their worktrees.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{Artifact, RemediationOutcome, TaskId};
use crate::orchestration::event::{EventSink, SchedulerEvent};
use crate::orchestration::followup::create_followups;
use crate::ports::{
    Collaborators, ConflictResolver, Evaluator, Fixer, Hosting, Mergeability, Review, Severity,
    Verdict, VersionControl,
};
use crate::{flog, flog_debug, flog_error, flog_warn, Error, Result};

/// What to do after a review that requested changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixDecision {
    Fix,
    Exhausted,
}

/// Fix-attempt budget with a bonus for convergent fixing.
///
/// The first `base` rounds always get a fix. Past that, another fix is
/// granted only while the error count keeps strictly decreasing, and never
/// beyond `base + buffer` rounds.
#[derive(Debug, Clone)]
pub struct FixBudget {
    base: u32,
    buffer: u32,
    previous: Option<usize>,
}

impl FixBudget {
    pub fn new(base: u32, buffer: u32) -> Self {
        Self {
            base,
            buffer,
            previous: None,
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.base + self.buffer
    }

    /// Decide for review round `round` (0-based, equal to the number of
    /// fixes applied so far) that reported `errors` error findings.
    pub fn decide(&mut self, round: u32, errors: usize) -> FixDecision {
        let progressing = self.previous.is_some_and(|prev| errors < prev);
        if round >= self.base && (!progressing || round >= self.ceiling()) {
            return FixDecision::Exhausted;
        }
        if round >= self.base {
            flog!(
                "Past base fix limit ({}/{}) but errors dropped {:?} -> {}; allowing another fix",
                round,
                self.base,
                self.previous,
                errors
            );
        }
        self.previous = Some(errors);
        FixDecision::Fix
    }
}

/// Timing and budget knobs for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_fix_attempts: u32,
    pub extra_fix_buffer: u32,
    /// Wait after approval before the first mergeability query.
    pub settle_delay: Duration,
    /// Extra queries while mergeability is still being computed.
    pub unknown_retries: u32,
    pub unknown_delay: Duration,
    /// Queries after a successful conflict resolution.
    pub post_resolve_polls: u32,
    pub post_resolve_delay: Duration,
    pub followups: bool,
    /// Label that makes follow-up issues eligible for a later run.
    pub ready_label: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_fix_attempts: 2,
            extra_fix_buffer: 3,
            settle_delay: Duration::from_secs(2),
            unknown_retries: 3,
            unknown_delay: Duration::from_secs(5),
            post_resolve_polls: 5,
            post_resolve_delay: Duration::from_secs(3),
            followups: true,
            ready_label: "agent-ready".to_string(),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_fix_attempts: config.max_fix_attempts,
            extra_fix_buffer: config.extra_fix_buffer,
            followups: config.followups,
            ready_label: config.label.clone(),
            ..Self::default()
        }
    }

    /// Same budgets with every wait removed.
    pub fn without_delays(mut self) -> Self {
        self.settle_delay = Duration::ZERO;
        self.unknown_delay = Duration::ZERO;
        self.post_resolve_delay = Duration::ZERO;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Reviewing,
    Fixing(Review),
    CheckingMergeable { after_resolution: bool },
    ResolvingConflicts,
    Merging,
    Landed,
    Failed(String),
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

pub struct Pipeline {
    task_id: TaskId,
    artifact: Artifact,
    vcs: Arc<dyn VersionControl>,
    hosting: Arc<dyn Hosting>,
    evaluator: Arc<dyn Evaluator>,
    fixer: Arc<dyn Fixer>,
    resolver: Arc<dyn ConflictResolver>,
    settings: Arc<PipelineSettings>,
    events: EventSink,
    cancel: CancellationToken,
    budget: FixBudget,
    round: u32,
    last_review: Option<Review>,
}

impl Pipeline {
    pub fn new(
        task_id: TaskId,
        artifact: Artifact,
        collaborators: &Collaborators,
        settings: Arc<PipelineSettings>,
        events: EventSink,
    ) -> Self {
        Self {
            task_id,
            artifact,
            vcs: collaborators.vcs.clone(),
            hosting: collaborators.hosting.clone(),
            evaluator: collaborators.evaluator.clone(),
            fixer: collaborators.fixer.clone(),
            resolver: collaborators.resolver.clone(),
            budget: FixBudget::new(settings.max_fix_attempts, settings.extra_fix_buffer),
            settings,
            events,
            cancel: CancellationToken::new(),
            round: 0,
            last_review: None,
        }
    }

    /// Stop at the next stage boundary once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Drive the change request to a terminal state.
    pub async fn run(mut self) -> RemediationOutcome {
        let mut stage = Stage::Reviewing;
        loop {
            flog_debug!("Pipeline #{} stage {:?}", self.artifact.number, stage);
            stage = match stage {
                Stage::Landed => return RemediationOutcome::Landed,
                Stage::Failed(error) => {
                    flog_error!("Pipeline for #{} failed: {}", self.artifact.number, error);
                    return RemediationOutcome::failed(error);
                }
                current if self.cancel.is_cancelled() => {
                    flog_warn!(
                        "Pipeline for #{} cancelled before {:?}",
                        self.artifact.number,
                        current
                    );
                    return RemediationOutcome::failed(Error::Cancelled.to_string());
                }
                current => match self.step(current).await {
                    Ok(next) => next,
                    Err(e) => Stage::Failed(e.to_string()),
                },
            };
        }
    }

    async fn step(&mut self, stage: Stage) -> Result<Stage> {
        match stage {
            Stage::Reviewing => self.review().await,
            Stage::Fixing(review) => self.fix(&review).await,
            Stage::CheckingMergeable { after_resolution } => {
                self.check_mergeable(after_resolution).await
            }
            Stage::ResolvingConflicts => self.resolve_conflicts().await,
            Stage::Merging => self.merge().await,
            terminal => Ok(terminal),
        }
    }

    async fn review(&mut self) -> Result<Stage> {
        let number = self.artifact.number;
        flog!("Reviewing #{} (round {})", number, self.round + 1);
        self.events.emit(SchedulerEvent::ReviewStarted {
            task_id: self.task_id.clone(),
            round: self.round + 1,
        });

        let review = self.evaluator.evaluate(&self.artifact).await.map_err(|e| {
            Error::Execution(format!("Review step failed for {}: {}", self.artifact.url, e))
        })?;

        let count = |s: Severity| review.findings.iter().filter(|f| f.severity == s).count();
        let errors = review.error_count();
        flog!(
            "#{} round {} findings: {} error(s), {} warning(s), {} suggestion(s)",
            number,
            self.round + 1,
            errors,
            count(Severity::Warning),
            count(Severity::Suggestion)
        );
        let verdict = review.verdict();
        self.events.emit(SchedulerEvent::ReviewFinished {
            task_id: self.task_id.clone(),
            verdict,
            errors,
        });

        if verdict == Verdict::Approve {
            self.last_review = Some(review);
            return Ok(Stage::CheckingMergeable {
                after_resolution: false,
            });
        }

        match self.budget.decide(self.round, errors) {
            FixDecision::Fix => Ok(Stage::Fixing(review)),
            FixDecision::Exhausted => Ok(Stage::Failed(format!(
                "Change request {} was not approved after {} fix attempt(s); {} error finding(s) remain",
                self.artifact.url, self.round, errors
            ))),
        }
    }

    async fn fix(&mut self, review: &Review) -> Result<Stage> {
        self.round += 1;
        flog!("#{} needs changes, running fix {}", self.artifact.number, self.round);
        self.events.emit(SchedulerEvent::FixStarted {
            task_id: self.task_id.clone(),
            attempt: self.round,
        });
        let report = self.fixer.fix(&self.artifact, review).await.map_err(|e| {
            Error::Execution(format!("Fix step failed for {}: {}", self.artifact.url, e))
        })?;
        if !report.success {
            return Ok(Stage::Failed(format!(
                "Fix step failed for {}: {}",
                self.artifact.url,
                report.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        Ok(Stage::Reviewing)
    }

    /// Query mergeability, re-asking while the host is still computing it.
    async fn poll_mergeability(&self, extra: u32, delay: Duration) -> Result<Mergeability> {
        let mut status = self.hosting.mergeability(&self.artifact).await?;
        let mut asked = 0;
        while status == Mergeability::Unknown && asked < extra {
            flog_debug!(
                "#{} mergeability unknown, re-checking ({}/{})",
                self.artifact.number,
                asked + 1,
                extra
            );
            pause(delay).await;
            status = self.hosting.mergeability(&self.artifact).await?;
            asked += 1;
        }
        Ok(status)
    }

    async fn check_mergeable(&mut self, after_resolution: bool) -> Result<Stage> {
        let settings = self.settings.clone();
        pause(settings.settle_delay).await;
        let status = if after_resolution {
            self.poll_mergeability(settings.post_resolve_polls.saturating_sub(1), settings.post_resolve_delay)
                .await
        } else {
            self.poll_mergeability(settings.unknown_retries, settings.unknown_delay)
                .await
        }
        .map_err(|e| {
            Error::Execution(format!(
                "Mergeability check failed for {}: {}",
                self.artifact.url, e
            ))
        })?;
        flog!("#{} mergeability: {:?}", self.artifact.number, status);

        match (status, after_resolution) {
            (Mergeability::Mergeable, _) => Ok(Stage::Merging),
            (other, true) => Ok(Stage::Failed(format!(
                "Change request {} is not mergeable after conflict resolution (status: {:?})",
                self.artifact.url, other
            ))),
            // Still unknown after every retry is treated as a conflict.
            (_, false) => Ok(Stage::ResolvingConflicts),
        }
    }

    async fn resolve_conflicts(&mut self) -> Result<Stage> {
        flog_warn!("#{} has conflicts, attempting resolution", self.artifact.number);
        self.events.emit(SchedulerEvent::ConflictsDetected {
            task_id: self.task_id.clone(),
        });
        let report = self.resolver.resolve(&self.artifact).await?;
        if !report.success {
            return Ok(Stage::Failed(format!(
                "Conflict resolution failed for {}: {}",
                self.artifact.url,
                report.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        flog!(
            "Resolved conflicts on #{} in {:?}",
            self.artifact.number,
            report.resolved_files
        );
        Ok(Stage::CheckingMergeable {
            after_resolution: true,
        })
    }

    async fn merge(&mut self) -> Result<Stage> {
        self.hosting.merge(&self.artifact).await.map_err(|e| {
            Error::Execution(format!("Merge step failed for {}: {}", self.artifact.url, e))
        })?;
        flog!("Merged #{}", self.artifact.number);
        self.events.emit(SchedulerEvent::Merged {
            task_id: self.task_id.clone(),
            url: self.artifact.url.clone(),
        });

        if let Err(e) = self.vcs.sync_base().await {
            flog_warn!("Updating base branch after merge failed: {}", e);
        }
        if self.settings.followups {
            if let Some(review) = &self.last_review {
                let urls = create_followups(
                    self.hosting.as_ref(),
                    &self.artifact,
                    review,
                    &self.settings.ready_label,
                )
                .await;
                if !urls.is_empty() {
                    flog!("Filed {} follow-up(s) for #{}", urls.len(), self.artifact.number);
                }
            }
        }
        Ok(Stage::Landed)
    }
}
