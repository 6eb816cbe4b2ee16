//! Application core: loop domain logic, zero I/O.
//!
//! This module holds the serialized loop service, the commands it
//! accepts, the events and signals it emits, and the **port traits**
//! defined in [`ports`] through which every store, pump family, and
//! stage implementation is reached.

pub mod commands;
pub mod events;
pub mod ports;
pub mod service;
pub mod signals;
