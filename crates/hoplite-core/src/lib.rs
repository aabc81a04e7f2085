//! Core types, traits, and machinery shared by the hoplite crates.
//!
//! This crate provides the fundamental abstractions used throughout the
//! traceroute implementation:
//!
//! - [`Target`], [`Options`], [`Hop`], and [`TraceMap`] data types
//! - The [`Tracer`] trait implemented by the protocol engines
//! - [`TraceError`] for error handling
//! - The per-target hop engine ([`run_targets`])
//! - The bounded exponential-backoff [`retry`](retry::retry) helper

pub mod collect;
pub mod dns;
pub mod engine;
pub mod error;
pub mod net;
pub mod retry;
pub mod types;

pub use engine::{run_targets, Tracer};
pub use error::TraceError;
pub use retry::RetryConfig;
pub use types::{Hop, HopAddress, Options, Probe, Protocol, Target, TraceMap};
