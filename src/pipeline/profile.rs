//! Profile synthesis.
//!
//! A pure function of the clinical settings: the same inputs always yield
//! byte-identical profiles.  It runs whenever a contributing setting
//! changes, never on the heartbeat schedule.
//!
//! Two profiles come out of one synthesis:
//! - **pump-native**: settings only, tuning excluded
//! - **active**: settings with the latest tuning result applied

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::keys::{ArtifactKey, retrieve_optional, retrieve_or_default};
use super::stage::{InputsBuilder, StageName, StageRegistry};
use super::checked_output;
use crate::app::ports::BlobStore;
use crate::error::PipelineError;

/// Everything the profile stage reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileInputs {
    pub preferences: Value,
    pub pump_settings: Value,
    pub bg_targets: Value,
    pub basal_profile: Value,
    pub insulin_sensitivities: Value,
    pub carb_ratios: Value,
    pub temp_targets: Value,
    pub insulin_model: Value,
    /// Latest tuning result, if tuning has ever run.
    pub autotune: Option<Value>,
}

impl ProfileInputs {
    /// Gather inputs from the blob store, defaulting absent settings.
    pub fn load(blobs: &dyn BlobStore) -> Self {
        Self {
            preferences: retrieve_or_default(blobs, ArtifactKey::Preferences),
            pump_settings: retrieve_or_default(blobs, ArtifactKey::PumpSettings),
            bg_targets: retrieve_or_default(blobs, ArtifactKey::BgTargets),
            basal_profile: retrieve_or_default(blobs, ArtifactKey::BasalProfile),
            insulin_sensitivities: retrieve_or_default(blobs, ArtifactKey::InsulinSensitivities),
            carb_ratios: retrieve_or_default(blobs, ArtifactKey::CarbRatios),
            temp_targets: retrieve_or_default(blobs, ArtifactKey::TempTargets),
            insulin_model: retrieve_or_default(blobs, ArtifactKey::InsulinModel),
            autotune: retrieve_optional(blobs, ArtifactKey::AutotuneResult),
        }
    }
}

/// Output of one synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSet {
    pub pump_native: Value,
    pub active: Value,
}

/// Run the profile stage twice: once without tuning, once with it.
pub fn synthesize(stages: &StageRegistry, inputs: &ProfileInputs) -> Result<ProfileSet, PipelineError> {
    let pump_native = run_profile_stage(stages, inputs, None)?;
    let active = run_profile_stage(stages, inputs, inputs.autotune.as_ref())?;
    Ok(ProfileSet {
        pump_native,
        active,
    })
}

fn run_profile_stage(
    stages: &StageRegistry,
    inputs: &ProfileInputs,
    autotune: Option<&Value>,
) -> Result<Value, PipelineError> {
    let stage_inputs = InputsBuilder::new()
        .with("preferences", inputs.preferences.clone())
        .with("pump_settings", inputs.pump_settings.clone())
        .with("bg_targets", inputs.bg_targets.clone())
        .with("basalprofile", inputs.basal_profile.clone())
        .with("isf", inputs.insulin_sensitivities.clone())
        .with("carb_ratio", inputs.carb_ratios.clone())
        .with("temptargets", inputs.temp_targets.clone())
        .with("model", inputs.insulin_model.clone())
        .with("autotune", autotune.cloned().unwrap_or(Value::Null))
        .build();
    checked_output(
        StageName::Profile,
        stages.run(StageName::Profile, &stage_inputs),
    )
}
