//! Pre-build: context assembly for one unit.

use std::sync::Arc;

use tracing::{error, info};

use super::CancelSignal;
use super::types::{Phase, UnitFailure};
use crate::context::ContextAssembler;
use crate::license::LicenseMaterial;
use crate::settings::Settings;
use crate::unit::{BuildUnit, ConfigDocument, UnitStatus};

/// Shared, read-only inputs of every pre-build task.
#[derive(Clone)]
pub struct PrebuildContext {
  pub settings: Arc<Settings>,
  pub document: Arc<ConfigDocument>,
  pub license: Arc<LicenseMaterial>,
  pub cancel: CancelSignal,
}

/// Result of one pre-build task. `unit` is `None` only if assembly panicked.
pub struct PrebuildOutput {
  pub index: usize,
  pub name: String,
  pub unit: Option<BuildUnit>,
  pub result: Result<(), UnitFailure>,
}

/// Move `unit` through `Loading` to `Loaded`, assembling its context on the blocking pool.
pub async fn prebuild(index: usize, mut unit: BuildUnit, ctx: PrebuildContext) -> PrebuildOutput {
  let name = unit.name().to_string();

  if let Err(e) = unit.transition(UnitStatus::Loading) {
    let failure = UnitFailure::new(&unit, Phase::PreBuild, e);
    unit.fail();
    return PrebuildOutput {
      index,
      name,
      unit: Some(unit),
      result: Err(failure),
    };
  }

  let assembled = tokio::task::spawn_blocking(move || {
    let assembler = ContextAssembler::new(&ctx.settings, &ctx.document, &ctx.license);
    let result = assembler.assemble(&mut unit, &ctx.cancel);
    (unit, result)
  })
  .await;

  let (mut unit, result) = match assembled {
    Ok(done) => done,
    Err(e) => {
      error!(unit = %name, error = %e, "context assembly panicked");
      return PrebuildOutput {
        index,
        name: name.clone(),
        unit: None,
        result: Err(UnitFailure {
          unit: name,
          phase: Phase::PreBuild,
          message: e.to_string(),
          log_path: Default::default(),
        }),
      };
    }
  };

  let result = match result {
    Ok(()) => unit
      .transition(UnitStatus::Loaded)
      .map_err(|e| UnitFailure::new(&unit, Phase::PreBuild, e)),
    Err(e) => Err(UnitFailure::new(&unit, Phase::PreBuild, e)),
  };

  match &result {
    Ok(()) => info!(unit = %name, "unit loaded"),
    Err(failure) => {
      error!(unit = %name, error = %failure.message, "pre-build failed");
      // best effort: the failure is reported either way
      let _ = unit.log().append(&format!("pre-build failed: {}", failure.message));
      unit.fail();
    }
  }

  PrebuildOutput {
    index,
    name,
    unit: Some(unit),
    result,
  }
}
