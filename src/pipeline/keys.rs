//! Blob store artifact keys and their cold-start defaults.
//!
//! Every artifact a stage reads or writes has one stable key.  When a key
//! is absent the reader substitutes the documented default for that
//! key's domain, so a cold-start cycle still produces a suggestion.
//!
//! | Key              | Default | Written by                |
//! |------------------|---------|---------------------------|
//! | `pumpHistory`    | `[]`    | event reconciliation      |
//! | `carbHistory`    | `[]`    | external carb entry       |
//! | `glucoseHistory` | `[]`    | glucose fetch merge       |
//! | `profile`        | `{}`    | profile synthesis         |
//! | `pumpProfile`    | `{}`    | profile synthesis         |
//! | `basalProfile`   | `[]`    | settings                  |
//! | `autosensResult` | `null`  | autosense pipeline        |
//! | `mealResult`     | `{}`    | decision cycle            |
//! | `iobResult`      | `[]`    | decision cycle            |
//! | `reservoirLevel` | `null`  | status supervisor         |
//! | `tempBasalState` | `{}`    | decision cycle (step 1)   |
//! | `clock`          | `null`  | decision cycle (step 1)   |
//! | `suggestion`     | `null`  | decision cycle            |

use serde_json::{Value, json};

use crate::app::ports::BlobStore;

/// Stable name of a persisted artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKey {
    // -- Histories --
    PumpHistory,
    CarbHistory,
    GlucoseHistory,

    // -- Profiles --
    Profile,
    PumpProfile,
    BasalProfile,

    // -- Cycle artifacts --
    Clock,
    TempBasalState,
    ReservoirLevel,
    MealResult,
    IobResult,
    Suggestion,

    // -- Auxiliary pipelines --
    AutosensResult,
    AutotunePrepared,
    AutotuneResult,

    // -- Settings consumed by profile synthesis --
    Preferences,
    PumpSettings,
    BgTargets,
    InsulinSensitivities,
    CarbRatios,
    TempTargets,
    InsulinModel,
}

impl ArtifactKey {
    /// Key string in the blob store.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PumpHistory => "monitor/pumpHistory.json",
            Self::CarbHistory => "monitor/carbHistory.json",
            Self::GlucoseHistory => "monitor/glucoseHistory.json",
            Self::Profile => "settings/profile.json",
            Self::PumpProfile => "settings/pumpProfile.json",
            Self::BasalProfile => "settings/basalProfile.json",
            Self::Clock => "monitor/clock.json",
            Self::TempBasalState => "monitor/tempBasalState.json",
            Self::ReservoirLevel => "monitor/reservoirLevel.json",
            Self::MealResult => "monitor/mealResult.json",
            Self::IobResult => "monitor/iobResult.json",
            Self::Suggestion => "enact/suggestion.json",
            Self::AutosensResult => "settings/autosensResult.json",
            Self::AutotunePrepared => "autotune/prepared.json",
            Self::AutotuneResult => "autotune/result.json",
            Self::Preferences => "settings/preferences.json",
            Self::PumpSettings => "settings/pumpSettings.json",
            Self::BgTargets => "settings/bgTargets.json",
            Self::InsulinSensitivities => "settings/insulinSensitivities.json",
            Self::CarbRatios => "settings/carbRatios.json",
            Self::TempTargets => "settings/tempTargets.json",
            Self::InsulinModel => "settings/insulinModel.json",
        }
    }

    /// Neutral value substituted when the key is absent.
    pub fn default_value(self) -> Value {
        match self {
            Self::PumpHistory
            | Self::CarbHistory
            | Self::GlucoseHistory
            | Self::BasalProfile
            | Self::IobResult
            | Self::TempTargets => json!([]),
            Self::Profile
            | Self::PumpProfile
            | Self::MealResult
            | Self::TempBasalState
            | Self::AutotunePrepared
            | Self::Preferences
            | Self::PumpSettings
            | Self::BgTargets
            | Self::InsulinSensitivities
            | Self::CarbRatios => json!({}),
            Self::InsulinModel => json!("rapid-acting"),
            Self::Clock
            | Self::ReservoirLevel
            | Self::Suggestion
            | Self::AutosensResult
            | Self::AutotuneResult => Value::Null,
        }
    }
}

impl core::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read `key`, falling back to its documented default.
pub fn retrieve_or_default(store: &dyn BlobStore, key: ArtifactKey) -> Value {
    store
        .retrieve(key.as_str())
        .unwrap_or_else(|| key.default_value())
}

/// Read `key` only if it has been produced; `None` (not the default) otherwise.
pub fn retrieve_optional(store: &dyn BlobStore, key: ArtifactKey) -> Option<Value> {
    store.retrieve(key.as_str()).filter(|v| !v.is_null())
}
