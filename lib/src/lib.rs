//! Support layer shared by the messaging driver crates.
//!
//! Holds the concerns that are not protocol: structured logging with a
//! pluggable backend ([`klog`]), the blocking wait queue used by the
//! event machinery ([`waitqueue`]), and the jiffies soft-clock that the
//! host environment advances ([`clock`]).

pub mod clock;
pub mod klog;
pub mod waitqueue;

pub use clock::JiffiesClock;
pub use waitqueue::{WaitQueue, Waiter};
