//! Relay server implementations

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub mod address;
pub mod tcprelay;
pub mod udprelay;

/// Teardown flag shared between a port listener and its active pipes
///
/// Set exactly once, when the listener is being removed or replaced. Pipes
/// consult it between blocks and terminate before processing the next one.
#[derive(Clone, Debug, Default)]
pub struct Teardown(Arc<AtomicBool>);

impl Teardown {
    pub fn new() -> Teardown {
        Teardown::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
