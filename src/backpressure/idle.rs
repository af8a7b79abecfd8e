//! Idle strategies for threads waiting on non-blocking operations.
//!
//! A strategy is told how much work the last duty cycle did. Work resets it
//! to the cheapest wait; consecutive empty cycles escalate it from
//! busy-spinning to yielding to parking with a doubling park period.

use std::hint;
use std::thread;
use std::time::Duration;

use crate::config::IdleConfig;

/// What a thread does between attempts of a non-blocking operation.
pub trait IdleStrategy: Send {
    /// Idle once, given the amount of work the last duty cycle performed.
    ///
    /// `work_count > 0` resets the strategy instead of idling.
    fn idle_with(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
        } else {
            self.idle();
        }
    }

    /// Idle once, escalating if called repeatedly without a reset.
    fn idle(&mut self);

    /// Idle once without waiting longer than `limit`.
    fn idle_at_most(&mut self, limit: Duration) {
        let _ = limit;
        self.idle();
    }

    /// Return to the cheapest wait.
    fn reset(&mut self);
}

/// Escalation phase of a [`BackoffIdleStrategy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffPhase {
    NotIdle,
    Spinning,
    Yielding,
    Parking,
}

/// Spin, then yield, then park with exponential backoff.
#[derive(Debug, Clone)]
pub struct BackoffIdleStrategy {
    max_spins: u64,
    max_yields: u64,
    min_park: Duration,
    max_park: Duration,
    phase: BackoffPhase,
    spins: u64,
    yields: u64,
    park_period: Duration,
}

impl BackoffIdleStrategy {
    pub const DEFAULT_MAX_SPINS: u64 = 10;
    pub const DEFAULT_MAX_YIELDS: u64 = 5;
    pub const DEFAULT_MIN_PARK: Duration = Duration::from_micros(1);
    pub const DEFAULT_MAX_PARK: Duration = Duration::from_millis(1);

    pub fn new(max_spins: u64, max_yields: u64, min_park: Duration, max_park: Duration) -> Self {
        let min_park = min_park.max(Duration::from_nanos(1));
        let max_park = max_park.max(min_park);
        BackoffIdleStrategy {
            max_spins,
            max_yields,
            min_park,
            max_park,
            phase: BackoffPhase::NotIdle,
            spins: 0,
            yields: 0,
            park_period: min_park,
        }
    }

    pub fn from_config(config: &IdleConfig) -> Self {
        Self::new(
            config.max_spins,
            config.max_yields,
            Duration::from_nanos(config.min_park_ns),
            Duration::from_nanos(config.max_park_ns),
        )
    }

    /// Current escalation phase.
    pub fn phase(&self) -> BackoffPhase {
        self.phase
    }

    /// Park period the next parking idle will use.
    pub fn park_period(&self) -> Duration {
        self.park_period
    }

    /// Advance the escalation state and return how long to park, if at all.
    fn advance(&mut self) -> Option<Duration> {
        match self.phase {
            BackoffPhase::NotIdle => {
                self.phase = BackoffPhase::Spinning;
                self.spins = 1;
                hint::spin_loop();
                None
            }
            BackoffPhase::Spinning => {
                hint::spin_loop();
                self.spins += 1;
                if self.spins > self.max_spins {
                    self.phase = BackoffPhase::Yielding;
                    self.yields = 0;
                }
                None
            }
            BackoffPhase::Yielding => {
                self.yields += 1;
                if self.yields > self.max_yields {
                    self.phase = BackoffPhase::Parking;
                    self.park_period = self.min_park;
                } else {
                    thread::yield_now();
                }
                None
            }
            BackoffPhase::Parking => {
                let period = self.park_period;
                self.park_period = (self.park_period * 2).min(self.max_park);
                Some(period)
            }
        }
    }
}

impl Default for BackoffIdleStrategy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_MAX_SPINS,
            Self::DEFAULT_MAX_YIELDS,
            Self::DEFAULT_MIN_PARK,
            Self::DEFAULT_MAX_PARK,
        )
    }
}

impl IdleStrategy for BackoffIdleStrategy {
    fn idle(&mut self) {
        if let Some(period) = self.advance() {
            thread::sleep(period);
        }
    }

    fn idle_at_most(&mut self, limit: Duration) {
        if let Some(period) = self.advance() {
            let period = period.min(limit);
            if !period.is_zero() {
                thread::sleep(period);
            }
        }
    }

    fn reset(&mut self) {
        self.phase = BackoffPhase::NotIdle;
        self.spins = 0;
        self.yields = 0;
        self.park_period = self.min_park;
    }
}

/// Always spin. Lowest latency, burns a core.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusySpinIdleStrategy;

impl IdleStrategy for BusySpinIdleStrategy {
    fn idle(&mut self) {
        hint::spin_loop();
    }

    fn reset(&mut self) {}
}

/// Always sleep a fixed period.
#[derive(Debug, Clone, Copy)]
pub struct SleepingIdleStrategy {
    period: Duration,
}

impl SleepingIdleStrategy {
    pub fn new(period: Duration) -> Self {
        SleepingIdleStrategy { period }
    }
}

impl IdleStrategy for SleepingIdleStrategy {
    fn idle(&mut self) {
        thread::sleep(self.period);
    }

    fn idle_at_most(&mut self, limit: Duration) {
        let period = self.period.min(limit);
        if !period.is_zero() {
            thread::sleep(period);
        }
    }

    fn reset(&mut self) {}
}
