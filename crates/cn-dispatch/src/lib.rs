//! Dispatch substrate for cantina; launches AI coding-agent CLIs as
//! supervised child processes.
//!
//! This crate provides:
//! - Provider command models for the primary CLI and two fallbacks
//! - A process supervisor with streaming output, total and stall
//!   timeouts, cooperative cancellation, and sentinel detection
//! - An ordered event stream consumed by the (out-of-scope) SSE layer
//! - Bounded in-memory job stores keyed by job id

pub mod events;
pub mod job_store;
pub mod provider;
pub mod redact;
pub mod result;
pub mod service;
pub mod supervisor;
