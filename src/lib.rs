//! Loopkeeper: closed-loop insulin delivery orchestration core.
//!
//! Exposes the loop service, its ports, and the reference adapters for
//! integration testing and for embedding in a host application.

#![deny(unused_must_use)]

// Provides the time driver that async-io-mini timers tick on.
use embassy_time as _;

pub mod app;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fsm;
pub mod glucose;
pub mod pipeline;
pub mod pump;
pub mod reconcile;
pub mod runtime;
pub mod safety;
pub mod scheduler;

pub mod adapters;
