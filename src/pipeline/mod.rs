//! Pipeline module - request construction, the run loop and the snapshot.

mod controller;
mod processor;
mod snapshot;

pub use controller::*;
pub use processor::*;
pub use snapshot::*;
