//! Neutral stage set.
//!
//! Stand-ins for the numeric core so the loop runs end-to-end without it.
//! Every stage returns a well-formed, inert result: no carbs on board, no
//! insulin on board, unit sensitivity, and a decision that never changes
//! delivery.

use serde_json::{Map, Value, json};

use crate::error::StageError;
use crate::pipeline::stage::{StageInputs, StageName, StageRegistry};

/// Registry with a neutral implementation for every stage.
pub fn neutral_stages() -> StageRegistry {
    let mut registry = StageRegistry::new();
    registry
        .register(StageName::Meal, meal)
        .register(StageName::Iob, iob)
        .register(StageName::Determine, determine)
        .register(StageName::Autosense, autosense)
        .register(StageName::AutotunePrep, autotune_prep)
        .register(StageName::AutotuneCore, autotune_core)
        .register(StageName::Profile, profile);
    registry
}

fn meal(_inputs: &StageInputs) -> Result<Value, StageError> {
    Ok(json!({ "carbs": 0, "mealCOB": 0 }))
}

fn iob(inputs: &StageInputs) -> Result<Value, StageError> {
    let time = inputs.get("clock").cloned().unwrap_or(Value::Null);
    Ok(json!([{ "iob": 0.0, "activity": 0.0, "time": time }]))
}

fn determine(inputs: &StageInputs) -> Result<Value, StageError> {
    let newest = inputs
        .get("glucose")
        .and_then(Value::as_array)
        .and_then(|history| history.first())
        .and_then(|reading| reading.get("value"))
        .cloned()
        .unwrap_or(Value::Null);
    Ok(json!({
        "reason": "neutral decision: no change",
        "bg": newest,
    }))
}

fn autosense(_inputs: &StageInputs) -> Result<Value, StageError> {
    Ok(json!({ "ratio": 1.0 }))
}

fn autotune_prep(_inputs: &StageInputs) -> Result<Value, StageError> {
    Ok(json!({
        "CSFGlucoseData": [],
        "ISFGlucoseData": [],
        "basalGlucoseData": [],
    }))
}

/// Echo the previous result unchanged.
fn autotune_core(inputs: &StageInputs) -> Result<Value, StageError> {
    match inputs.get("previous") {
        Some(Value::Null) | None => Err(StageError::Failed("no previous profile".into())),
        Some(previous) => Ok(previous.clone()),
    }
}

/// Gather the settings into one profile object.  Keys are sorted by the
/// JSON map, so equal inputs serialize identically.
fn profile(inputs: &StageInputs) -> Result<Value, StageError> {
    let mut out = Map::new();
    for (name, value) in inputs {
        if name != "autotune" {
            out.insert(name.clone(), value.clone());
        }
    }
    if let Some(Value::Object(tuned)) = inputs.get("autotune") {
        for key in ["basalprofile", "isf", "carb_ratio"] {
            if let Some(v) = tuned.get(key) {
                out.insert(key.to_owned(), v.clone());
            }
        }
        out.insert("autotuned".into(), Value::Bool(true));
    }
    Ok(Value::Object(out))
}
