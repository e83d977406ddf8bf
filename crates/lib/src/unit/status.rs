//! Lifecycle states of a build unit.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Where a unit is in its build and push lifecycle.
///
/// The happy path is `Unknown → Loading → Loaded → Building → Built → (Pushing →) Pushed`.
/// `Failed` is reachable from every non-terminal state. `DoNotBuild` is only assigned to
/// units that were never loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitStatus {
  #[default]
  Unknown,
  DoNotBuild,
  Failed,
  Loading,
  Loaded,
  Building,
  Built,
  Pushing,
  Pushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal status transition from {from} to {to}")]
pub struct TransitionError {
  pub from: UnitStatus,
  pub to: UnitStatus,
}

impl UnitStatus {
  /// Terminal states accept no further transitions.
  pub fn is_terminal(self) -> bool {
    matches!(self, UnitStatus::Pushed | UnitStatus::Failed | UnitStatus::DoNotBuild)
  }

  pub fn can_transition(self, next: UnitStatus) -> bool {
    use UnitStatus::*;

    if self.is_terminal() {
      return false;
    }
    matches!(
      (self, next),
      (_, Failed)
        | (Unknown, DoNotBuild)
        | (Unknown, Loading)
        | (Loading, Loaded)
        | (Loaded, Building)
        | (Building, Built)
        | (Built, Pushing)
        | (Built, Pushed)
        | (Pushing, Pushed)
    )
  }

  /// Validate a move to `next`, returning the new state.
  pub fn transition(self, next: UnitStatus) -> Result<UnitStatus, TransitionError> {
    if self.can_transition(next) {
      Ok(next)
    } else {
      Err(TransitionError { from: self, to: next })
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      UnitStatus::Unknown => "unknown",
      UnitStatus::DoNotBuild => "do-not-build",
      UnitStatus::Failed => "failed",
      UnitStatus::Loading => "loading",
      UnitStatus::Loaded => "loaded",
      UnitStatus::Building => "building",
      UnitStatus::Built => "built",
      UnitStatus::Pushing => "pushing",
      UnitStatus::Pushed => "pushed",
    }
  }
}

impl fmt::Display for UnitStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
