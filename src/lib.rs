//! Minimal replicated state-machine service.
//!
//! A cluster of nodes agrees on a single order of client-submitted messages,
//! applies each one deterministically to identical local state, and returns the
//! result to the originating client session.
//!
//! Layers, leaf first:
//! - [`codec`]: wire payload encodings (fixed-width integer, ASCII text)
//! - [`backpressure`]: idle strategies and the bounded-retry send gate
//! - [`kernel`]: the deterministic side (service interface, session manager,
//!   executor, snapshots)
//! - [`cluster`]: the substrate seams, an in-memory ordered log and transport,
//!   node runner, client facade and liveness monitor
//!
//! The consensus substrate, durable log and real network transport are consumed
//! through the traits in [`cluster::substrate`].

pub mod backpressure;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod error;
pub mod kernel;
pub mod logging;

pub use error::{Error, Result};
