//! Bounded blocking send over a non-blocking offer.
//!
//! The gate retries `offer` until the destination accepts the buffer, the
//! destination is known closed, or the caller's deadline passes. Between
//! attempts it runs the caller's duty cycle (egress polling, keep-alives) and
//! then idles according to its strategy, so waiting is never a pure sleep.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::cluster::substrate::{OfferOutcome, Publication};

use super::idle::{BackoffIdleStrategy, IdleStrategy};

/// Why a gated send did not complete.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GateError {
    /// The deadline passed before the destination accepted the buffer.
    #[error("send timed out after {attempts} attempts ({waited:?})")]
    SendTimeout { attempts: u64, waited: Duration },

    /// The destination is closed; retrying cannot succeed.
    #[error("destination closed")]
    SessionClosed,
}

/// Retry loop around [`Publication::offer`].
#[derive(Debug)]
pub struct BackpressureGate<I: IdleStrategy = BackoffIdleStrategy> {
    idle: I,
}

impl<I: IdleStrategy> BackpressureGate<I> {
    pub fn new(idle: I) -> Self {
        BackpressureGate { idle }
    }

    /// Offer `buffer` until accepted, closed, or `deadline`.
    ///
    /// `duty` runs between attempts and returns how much work it did; any work
    /// resets the idle strategy. Returns the number of rejected offers that
    /// preceded acceptance.
    pub fn send<P, F>(
        &mut self,
        publication: &mut P,
        buffer: &[u8],
        deadline: Instant,
        mut duty: F,
    ) -> Result<u64, GateError>
    where
        P: Publication + ?Sized,
        F: FnMut() -> usize,
    {
        let start = Instant::now();
        let mut attempts = 0u64;
        self.idle.reset();

        loop {
            match publication.offer(buffer) {
                OfferOutcome::Accepted => {
                    self.idle.reset();
                    return Ok(attempts);
                }
                OfferOutcome::Closed => return Err(GateError::SessionClosed),
                OfferOutcome::BackPressured | OfferOutcome::NotConnected => {
                    attempts += 1;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(GateError::SendTimeout {
                    attempts,
                    waited: now.duration_since(start),
                });
            }

            let work = duty();
            if work > 0 {
                self.idle.reset();
            } else {
                self.idle.idle_at_most(deadline.saturating_duration_since(Instant::now()));
            }
        }
    }

    /// [`send`](Self::send) with a relative timeout.
    pub fn send_within<P, F>(
        &mut self,
        publication: &mut P,
        buffer: &[u8],
        timeout: Duration,
        duty: F,
    ) -> Result<u64, GateError>
    where
        P: Publication + ?Sized,
        F: FnMut() -> usize,
    {
        self.send(publication, buffer, Instant::now() + timeout, duty)
    }

    /// Idle once through the gate's strategy, after `work_count` units of work.
    pub fn idle(&mut self, work_count: usize) {
        self.idle.idle_with(work_count);
    }

    pub fn idle_strategy(&self) -> &I {
        &self.idle
    }
}

impl Default for BackpressureGate<BackoffIdleStrategy> {
    fn default() -> Self {
        Self::new(BackoffIdleStrategy::default())
    }
}
