//! Backpressure: idle strategies and the bounded-retry send gate shared by the
//! client ingress path and the node egress path.

pub mod gate;
pub mod idle;

pub use gate::{BackpressureGate, GateError};
pub use idle::{BackoffIdleStrategy, BackoffPhase, BusySpinIdleStrategy, IdleStrategy, SleepingIdleStrategy};
