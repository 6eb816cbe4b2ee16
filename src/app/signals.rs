//! Typed publish/subscribe channel per observable signal.
//!
//! Subscribers register per signal kind and are called synchronously, on
//! the serialized context, in registration order.  A signal is published
//! only when its value changes; the supervisor decides that, not the bus.

use chrono::{DateTime, Utc};

use crate::error::DriverError;
use crate::pipeline::suggestion::Suggestion;
use crate::pump::ReservoirLevel;

/// One observable change.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Reservoir(ReservoirLevel),
    ManualOverride(bool),
    Expiry(Option<DateTime<Utc>>),
    Battery(Option<u8>),
    /// The device reported deactivation at this time.
    Deactivated(DateTime<Utc>),
    /// Fault bits newly set (mask of the whole active set).
    PumpFault(u8),
    /// Every fault cleared.
    PumpFaultCleared,
    DriverError(DriverError),
    Suggestion(Suggestion),
}

/// Handlers for a single value type.
pub struct Subscribers<T> {
    handlers: Vec<Box<dyn FnMut(&T)>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }
}

impl<T> Subscribers<T> {
    pub fn subscribe(&mut self, handler: impl FnMut(&T) + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn publish(&mut self, value: &T) {
        for handler in &mut self.handlers {
            handler(value);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Fault set change published on the `faults` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultChange {
    Set(u8),
    Cleared,
}

/// One subscriber list per signal kind.
#[derive(Default)]
pub struct SignalBus {
    pub reservoir: Subscribers<ReservoirLevel>,
    pub manual_override: Subscribers<bool>,
    pub expiry: Subscribers<Option<DateTime<Utc>>>,
    pub battery: Subscribers<Option<u8>>,
    pub deactivation: Subscribers<DateTime<Utc>>,
    pub faults: Subscribers<FaultChange>,
    pub driver_errors: Subscribers<DriverError>,
    pub suggestions: Subscribers<Suggestion>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `signal` to its channel.
    pub fn publish(&mut self, signal: &Signal) {
        match signal {
            Signal::Reservoir(level) => self.reservoir.publish(level),
            Signal::ManualOverride(on) => self.manual_override.publish(on),
            Signal::Expiry(at) => self.expiry.publish(at),
            Signal::Battery(pct) => self.battery.publish(pct),
            Signal::Deactivated(at) => self.deactivation.publish(at),
            Signal::PumpFault(mask) => self.faults.publish(&FaultChange::Set(*mask)),
            Signal::PumpFaultCleared => self.faults.publish(&FaultChange::Cleared),
            Signal::DriverError(e) => self.driver_errors.publish(e),
            Signal::Suggestion(s) => self.suggestions.publish(s),
        }
    }
}
