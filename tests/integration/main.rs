//! Integration test driver for the `tests/integration/` submodules.
//!
//! Each `mod` below maps to a file that drives the loop service, or one
//! of its components, through the in-memory adapters and a mock pump.

mod alert_tests;
mod pipeline_tests;
mod status_tests;
mod sync_tests;
