//! Ratekeeper - Distributed Admission Control
//!
//! This crate decides "allow or deny" for a request key consistently across
//! any number of stateless processes. Each decision is a single atomic Lua
//! script executed by a shared Redis store, using one of four algorithms:
//! fixed window, sliding log, token bucket, or a hybrid of the last two.
//! When the store is unreachable the configured fail-open / fail-close
//! policy decides instead.

pub mod config;
pub mod error;
pub mod ratelimit;
