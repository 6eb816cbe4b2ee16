//! Pipeline orchestrator.
//!
//! Sequences stage invocations for one decision cycle and for the
//! auxiliary pipelines.  Every stage's output is persisted before the
//! next stage reads it:
//!
//! ```text
//!  clock, tempBasal, autosens ──▶ blob store
//!                                   │
//!          ┌────────────────────────┘
//!          ▼
//!   meal stage ──▶ mealResult ──▶ iob stage ──▶ iobResult ──▶ determine ──▶ suggestion
//! ```
//!
//! A failing stage aborts the run with [`PipelineError::StageFailed`];
//! artifacts already written are left in place for the next cycle.
//! Runs are synchronous and are only ever called from the serialized
//! worker, so no two stages or cycles overlap.

pub mod keys;
pub mod profile;
pub mod stage;
pub mod suggestion;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::{Value, json};

use crate::app::ports::BlobStore;
use crate::config::LoopConfig;
use crate::error::{PipelineError, StageError};
use keys::{ArtifactKey, retrieve_optional, retrieve_or_default};
use profile::{ProfileInputs, ProfileSet};
use stage::{InputsBuilder, StageName, StageRegistry};
use suggestion::{Suggestion, TempBasalState};

/// Drives the stage chain.  Owns the stage implementations; the blob
/// store is injected per run.
pub struct Pipeline {
    stages: StageRegistry,
    micro_bolus_allowed: bool,
    categorize_uam_as_basal: bool,
    tune_insulin_curve: bool,
}

impl Pipeline {
    pub fn new(stages: StageRegistry, config: &LoopConfig) -> Self {
        Self {
            stages,
            micro_bolus_allowed: config.micro_bolus_allowed,
            categorize_uam_as_basal: config.autotune_categorize_uam_as_basal,
            tune_insulin_curve: config.autotune_tune_insulin_curve,
        }
    }

    // ── Decision cycle ────────────────────────────────────────

    /// Run meal → iob → determine for `clock` and persist the suggestion.
    pub fn run_decision_cycle(
        &self,
        blobs: &mut dyn BlobStore,
        clock: DateTime<Utc>,
        temp_basal: &TempBasalState,
    ) -> Result<Suggestion, PipelineError> {
        let clock_json = Value::String(clock.to_rfc3339());

        // 1. Cycle inputs
        persist(blobs, ArtifactKey::Clock, &clock_json)?;
        persist(blobs, ArtifactKey::TempBasalState, &json!(temp_basal))?;
        let autosens = retrieve_optional(blobs, ArtifactKey::AutosensResult).unwrap_or(Value::Null);
        persist(blobs, ArtifactKey::AutosensResult, &autosens)?;

        let pump_history = retrieve_or_default(blobs, ArtifactKey::PumpHistory);
        let glucose = retrieve_or_default(blobs, ArtifactKey::GlucoseHistory);
        let profile = retrieve_or_default(blobs, ArtifactKey::Profile);

        // 2. Meal
        let meal_inputs = InputsBuilder::new()
            .with("pumphistory", pump_history.clone())
            .with("carbhistory", retrieve_or_default(blobs, ArtifactKey::CarbHistory))
            .with("glucose", glucose.clone())
            .with("profile", profile.clone())
            .with("basalprofile", retrieve_or_default(blobs, ArtifactKey::BasalProfile))
            .with("clock", clock_json.clone())
            .build();
        let meal = self.invoke(StageName::Meal, &meal_inputs)?;
        persist(blobs, ArtifactKey::MealResult, &meal)?;

        // 3. IOB
        let iob_inputs = InputsBuilder::new()
            .with("pumphistory", pump_history)
            .with("profile", profile.clone())
            .with("clock", clock_json)
            .with("autosens", autosens.clone())
            .build();
        let iob = self.invoke(StageName::Iob, &iob_inputs)?;
        persist(blobs, ArtifactKey::IobResult, &iob)?;

        // 4. Determine
        let determine_inputs = InputsBuilder::new()
            .with("glucose", glucose)
            .with("currenttemp", retrieve_or_default(blobs, ArtifactKey::TempBasalState))
            .with("iob", retrieve_or_default(blobs, ArtifactKey::IobResult))
            .with("profile", profile)
            .with("autosens", autosens)
            .with("meal", retrieve_or_default(blobs, ArtifactKey::MealResult))
            .with("reservoir", retrieve_or_default(blobs, ArtifactKey::ReservoirLevel))
            .with("microbolusallowed", Value::Bool(self.micro_bolus_allowed))
            .build();
        let raw = self.invoke(StageName::Determine, &determine_inputs)?;
        let suggestion = Suggestion::from_stage_output(raw, clock).map_err(|reason| {
            PipelineError::StageFailed {
                stage: StageName::Determine,
                reason,
            }
        })?;
        persist(blobs, ArtifactKey::Suggestion, &json!(suggestion))?;

        info!(
            "cycle {}: rate={:?} duration={:?} units={:?}",
            clock.to_rfc3339(),
            suggestion.rate,
            suggestion.duration,
            suggestion.units
        );
        Ok(suggestion)
    }

    // ── Auxiliary pipelines ───────────────────────────────────

    /// Sensitivity recalibration.  Its output becomes an optional input
    /// to later decision cycles.
    pub fn run_autosense(&self, blobs: &mut dyn BlobStore) -> Result<Value, PipelineError> {
        let inputs = InputsBuilder::new()
            .with("pumphistory", retrieve_or_default(blobs, ArtifactKey::PumpHistory))
            .with("profile", retrieve_or_default(blobs, ArtifactKey::Profile))
            .with("carbhistory", retrieve_or_default(blobs, ArtifactKey::CarbHistory))
            .with("glucose", retrieve_or_default(blobs, ArtifactKey::GlucoseHistory))
            .with("basalprofile", retrieve_or_default(blobs, ArtifactKey::BasalProfile))
            .with("temptargets", Value::Null)
            .build();
        let result = self.invoke(StageName::Autosense, &inputs)?;
        persist(blobs, ArtifactKey::AutosensResult, &result)?;
        info!("autosense: result persisted");
        Ok(result)
    }

    /// Two-stage tuning: prepare a dataset, then run the tuner over it.
    pub fn run_autotune(&self, blobs: &mut dyn BlobStore) -> Result<Value, PipelineError> {
        let profile = retrieve_or_default(blobs, ArtifactKey::Profile);

        let prep_inputs = InputsBuilder::new()
            .with("pumphistory", retrieve_or_default(blobs, ArtifactKey::PumpHistory))
            .with("profile", profile.clone())
            .with("glucose", retrieve_or_default(blobs, ArtifactKey::GlucoseHistory))
            .with("categorize_uam_as_basal", Value::Bool(self.categorize_uam_as_basal))
            .with("tune_insulin_curve", Value::Bool(self.tune_insulin_curve))
            .build();
        let prepared = self.invoke(StageName::AutotunePrep, &prep_inputs)?;
        persist(blobs, ArtifactKey::AutotunePrepared, &prepared)?;

        let previous = retrieve_optional(blobs, ArtifactKey::AutotuneResult)
            .unwrap_or_else(|| profile.clone());
        let base = retrieve_optional(blobs, ArtifactKey::PumpProfile).unwrap_or(profile);
        let run_inputs = InputsBuilder::new()
            .with("prepared", prepared)
            .with("previous", previous)
            .with("profile", base)
            .build();
        let result = self.invoke(StageName::AutotuneCore, &run_inputs)?;
        persist(blobs, ArtifactKey::AutotuneResult, &result)?;
        info!("autotune: result persisted");
        Ok(result)
    }

    /// Rebuild pump-native and active profiles from current settings.
    pub fn synthesize_profiles(&self, blobs: &mut dyn BlobStore) -> Result<ProfileSet, PipelineError> {
        let inputs = ProfileInputs::load(blobs);
        let set = profile::synthesize(&self.stages, &inputs)?;
        persist(blobs, ArtifactKey::PumpProfile, &set.pump_native)?;
        persist(blobs, ArtifactKey::Profile, &set.active)?;
        info!("profile: pump-native and active profiles persisted");
        Ok(set)
    }

    // ── Internal ──────────────────────────────────────────────

    fn invoke(&self, stage: StageName, inputs: &stage::StageInputs) -> Result<Value, PipelineError> {
        checked_output(stage, self.stages.run(stage, inputs))
    }
}

/// Map a raw stage result into a usable value or `StageFailed`.
///
/// `null` and objects carrying an `error` field count as failures.
pub(crate) fn checked_output(
    stage: StageName,
    result: Result<Value, StageError>,
) -> Result<Value, PipelineError> {
    let fail = |reason: String| {
        warn!("stage {} failed: {}", stage, reason);
        PipelineError::StageFailed { stage, reason }
    };
    match result {
        Err(e) => Err(fail(e.to_string())),
        Ok(Value::Null) => Err(fail("empty result".into())),
        Ok(Value::Object(obj)) if obj.contains_key("error") => {
            let reason = match &obj["error"] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Err(fail(reason))
        }
        Ok(v) => Ok(v),
    }
}

fn persist(blobs: &mut dyn BlobStore, key: ArtifactKey, value: &Value) -> Result<(), PipelineError> {
    blobs.save(key.as_str(), value).map_err(|source| {
        warn!("could not persist {}: {}", key, source);
        PipelineError::StoreWriteFailed { key, source }
    })
}
