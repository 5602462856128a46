//! Run state machine.
//!
//! `Idle -> Resolving -> Building -> Pushing -> Applying -> Done`, with
//! `Failed(stage, cause)` reachable from every working stage. With
//! `skip_build` the run goes straight from `Resolving` to `Applying`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::RemoteError;

/// A working stage of a run. These are the stages that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Evaluating providers and plugins into a manifest.
    Resolving,
    /// Building the container image.
    Building,
    /// Pushing the image to its registry.
    Pushing,
    /// Applying manifest resources to the cluster.
    Applying,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolving => "Resolving",
            Self::Building => "Building",
            Self::Pushing => "Pushing",
            Self::Applying => "Applying",
        };
        f.write_str(name)
    }
}

/// State of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RunState {
    /// Not started.
    Idle,
    /// See [`Stage::Resolving`].
    Resolving,
    /// See [`Stage::Building`].
    Building,
    /// See [`Stage::Pushing`].
    Pushing,
    /// See [`Stage::Applying`].
    Applying,
    /// Every stage completed.
    Done,
    /// Terminal failure.
    Failed {
        /// Stage that failed.
        stage: Stage,
        /// Raw cause.
        cause: RemoteError,
    },
}

impl RunState {
    /// True for `Done` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }

    /// The working stage this state represents, if any.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Resolving => Some(Stage::Resolving),
            Self::Building => Some(Stage::Building),
            Self::Pushing => Some(Stage::Pushing),
            Self::Applying => Some(Stage::Applying),
            Self::Failed { stage, .. } => Some(*stage),
            Self::Idle | Self::Done => None,
        }
    }

    /// Checks whether `next` may follow this state.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Idle, Self::Resolving)
            | (Self::Resolving, Self::Building | Self::Applying)
            | (Self::Building, Self::Pushing)
            | (Self::Pushing, Self::Applying)
            | (Self::Applying, Self::Done) => true,
            (current, Self::Failed { stage, .. }) => current.stage() == Some(*stage),
            _ => false,
        }
    }
}

impl From<Stage> for RunState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Resolving => Self::Resolving,
            Stage::Building => Self::Building,
            Stage::Pushing => Self::Pushing,
            Stage::Applying => Self::Applying,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Done => f.write_str("Done"),
            Self::Failed { stage, cause } => write!(f, "Failed({stage}, {cause})"),
            other => match other.stage() {
                Some(stage) => fmt::Display::fmt(&stage, f),
                None => Ok(()),
            },
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    /// State entered.
    #[serde(flatten)]
    pub state: RunState,
    /// When it was entered.
    pub at: DateTime<Utc>,
}
