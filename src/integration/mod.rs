//! # Integration Module
//!
//! Invocation of external workers behind circuit breakers, retries and
//! bulkheads, over a direct, queued, event or streamed transport.

pub mod errors;
pub mod manager;
pub mod strategy;
pub mod worker;

pub use errors::{IntegrationError, InvocationFailure};
pub use manager::{IntegrationManager, IntegrationTarget};
pub use strategy::InvocationStrategy;
pub use worker::{FnWorker, InvocationRequest, Worker, WorkerError};
