//! Wall-clock abstraction for expiry checks.
//!
//! Key lifetimes and approval grants are absolute deadlines compared against
//! [`Clock::now`].  Production code uses [`SystemClock`]; tests drive a
//! manual clock forward to cross deadlines without sleeping.

use std::time::SystemTime;

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> SystemTime;
}

/// Wall-clock time via `SystemTime::now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
