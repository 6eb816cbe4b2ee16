//! Stage naming, input assembly, and the stage registry.
//!
//! Stages are opaque numeric functions behind the [`Stage`] port.  The
//! orchestrator only knows their names, which keys they read, and which
//! single key they write.

use std::collections::HashMap;

use log::debug;
use serde_json::{Map, Value};

use crate::app::ports::Stage;
use crate::error::StageError;

/// Named JSON inputs handed to one stage invocation.
pub type StageInputs = Map<String, Value>;

/// Every stage the orchestrator can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageName {
    Meal,
    Iob,
    Determine,
    Autosense,
    AutotunePrep,
    AutotuneCore,
    Profile,
}

impl StageName {
    pub const ALL: [Self; 7] = [
        Self::Meal,
        Self::Iob,
        Self::Determine,
        Self::Autosense,
        Self::AutotunePrep,
        Self::AutotuneCore,
        Self::Profile,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Meal => "meal",
            Self::Iob => "iob",
            Self::Determine => "determine",
            Self::Autosense => "autosense",
            Self::AutotunePrep => "autotune-prep",
            Self::AutotuneCore => "autotune-core",
            Self::Profile => "profile",
        }
    }
}

impl core::fmt::Display for StageName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder-style helper for a stage's input mapping.
#[derive(Debug, Default)]
pub struct InputsBuilder {
    inputs: StageInputs,
}

impl InputsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.inputs.insert(name.to_owned(), value);
        self
    }

    pub fn build(self) -> StageInputs {
        self.inputs
    }
}

/// Lookup table from [`StageName`] to implementation.
///
/// Implementations are selected once at startup; a missing entry fails
/// only the pipeline that needs it.
#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<StageName, Box<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the implementation for `name`.
    pub fn register(&mut self, name: StageName, stage: impl Stage + 'static) -> &mut Self {
        self.stages.insert(name, Box::new(stage));
        self
    }

    pub fn contains(&self, name: StageName) -> bool {
        self.stages.contains_key(&name)
    }

    /// Invoke `name` synchronously.
    pub fn run(&self, name: StageName, inputs: &StageInputs) -> Result<Value, StageError> {
        let stage = self.stages.get(&name).ok_or(StageError::Missing)?;
        debug!("stage {} with inputs [{}]", name, key_list(inputs));
        stage.run(inputs)
    }
}

fn key_list(inputs: &StageInputs) -> String {
    inputs.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
}
