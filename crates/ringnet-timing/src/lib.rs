//! Monotonic timing primitives used for transaction deadlines and
//! reconnect cadence.
//!
//! Trimmed from the teacher crate's TSC-backed clock: the networking core
//! only ever needs a monotonic deadline and a periodic "has this interval
//! elapsed" check, so `Instant`/`Duration` wrap `std::time` directly instead
//! of a calibrated rdtscp counter.

mod duration;
mod instant;
mod repeater;

pub use duration::Duration;
pub use instant::Instant;
pub use repeater::Repeater;
