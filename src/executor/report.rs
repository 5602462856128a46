//! Run reports.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::backends::ApplyOutcome;
use crate::error::{BerthError, ExecutionError, RemoteError, Result};
use crate::manifest::ResourceKey;

use super::state::{RunState, Stage, Transition};

/// Outcome for one applied resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceReport {
    /// `Kind/namespace/name`.
    pub resource: String,
    /// What the cluster did.
    pub outcome: ApplyOutcome,
}

impl ResourceReport {
    /// Creates a report entry.
    #[must_use]
    pub fn new(key: &ResourceKey, outcome: ApplyOutcome) -> Self {
        Self {
            resource: key.to_string(),
            outcome,
        }
    }
}

/// Everything that happened during one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run identifier, also on the `run` tracing span.
    pub run_id: Uuid,
    /// Environment name.
    pub environment: String,
    /// Final (or current) state.
    pub state: RunState,
    /// Every state entered, in order, starting with `Idle`.
    pub transitions: Vec<Transition>,
    /// Tagged image reference.
    pub image: Option<String>,
    /// Registry digest of the pushed image.
    pub digest: Option<String>,
    /// Digest of the rendered manifest.
    pub manifest_digest: Option<String>,
    /// Resources the cluster accepted, in manifest order.
    pub applied: Vec<ResourceReport>,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end, set once terminal.
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    /// Creates an `Idle` report.
    #[must_use]
    pub fn new(run_id: Uuid, environment: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            environment: environment.into(),
            state: RunState::Idle,
            transitions: vec![Transition {
                state: RunState::Idle,
                at: now,
            }],
            image: None,
            digest: None,
            manifest_digest: None,
            applied: Vec::new(),
            started_at: now,
            finished_at: None,
        }
    }

    /// Records a transition. Terminal states also set `finished_at`.
    pub(crate) fn enter(&mut self, state: RunState) {
        debug_assert!(
            self.state.can_transition_to(&state),
            "illegal transition {} -> {state}",
            self.state
        );
        let at = Utc::now();
        if state.is_terminal() {
            self.finished_at = Some(at);
        }
        self.transitions.push(Transition {
            state: state.clone(),
            at,
        });
        self.state = state;
    }

    /// Records a failure of `stage`.
    pub(crate) fn fail(&mut self, stage: Stage, cause: RemoteError) {
        self.enter(RunState::Failed { stage, cause });
    }

    /// True if the run reached `Done`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.state, RunState::Done)
    }

    /// Failed stage and cause, if the run failed.
    #[must_use]
    pub const fn failure(&self) -> Option<(Stage, &RemoteError)> {
        match &self.state {
            RunState::Failed { stage, cause } => Some((*stage, cause)),
            _ => None,
        }
    }

    /// True if `state` was entered during the run.
    #[must_use]
    pub fn visited(&self, state: &RunState) -> bool {
        self.transitions.iter().any(|t| &t.state == state)
    }

    /// Number of resources with the given outcome.
    #[must_use]
    pub fn count(&self, outcome: ApplyOutcome) -> usize {
        self.applied.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Run duration, once finished.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    /// Converts a failed run into an [`ExecutionError`].
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Failed` with the stage and cause when the
    /// run did not reach `Done`.
    pub fn into_result(self) -> Result<Self> {
        match self.state {
            RunState::Failed { stage, cause } => {
                Err(BerthError::Execution(ExecutionError::Failed { stage, cause }))
            }
            _ => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_records_transitions() {
        let mut report = RunReport::new(Uuid::new_v4(), "production");
        report.enter(RunState::Resolving);
        report.enter(RunState::Applying);
        report.enter(RunState::Done);

        assert!(report.is_success());
        assert!(report.visited(&RunState::Applying));
        assert!(!report.visited(&RunState::Building));
        assert_eq!(report.transitions.len(), 4);
        assert!(report.finished_at.is_some());
        assert!(report.duration().is_some());
    }

    #[test]
    fn test_failed_report_into_result() {
        let mut report = RunReport::new(Uuid::new_v4(), "production");
        report.enter(RunState::Resolving);
        report.enter(RunState::Building);
        report.fail(Stage::Building, RemoteError::remote("no Dockerfile"));

        assert_eq!(report.failure().map(|(stage, _)| stage), Some(Stage::Building));
        let err = report.into_result().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Building));
        assert!(err.to_string().contains("Building failed: no Dockerfile"));
    }

    #[test]
    fn test_count_outcomes() {
        let key = |name: &str| ResourceKey {
            kind: String::from("Service"),
            namespace: Some(String::from("prod")),
            name: name.to_string(),
        };
        let mut report = RunReport::new(Uuid::new_v4(), "production");
        report.applied = vec![
            ResourceReport::new(&key("a"), ApplyOutcome::Applied),
            ResourceReport::new(&key("b"), ApplyOutcome::Unchanged),
            ResourceReport::new(&key("c"), ApplyOutcome::Unchanged),
        ];
        assert_eq!(report.count(ApplyOutcome::Unchanged), 2);
        assert_eq!(report.applied[0].resource, "Service/prod/a");
    }
}
