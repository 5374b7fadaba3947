//! kubeload drives a weighted mixture of Kubernetes API requests against
//! one or more connections, classifies every response, and reports per-URL
//! latency distributions, received bytes, and a fault taxonomy.
//!
//! The pipeline: a [`config::LoadProfile`] describes the mixture; the
//! [`generator`] turns it into a stream of request builders; the
//! [`scheduler`] executes them through a rate-limited worker pool; the
//! [`metrics`] collector gathers outcomes; and [`report`] renders and
//! merges the results.

pub mod builders;
pub mod client;
pub mod config;
pub mod errors;
pub mod generator;
pub mod metrics;
pub mod report;
pub mod request;
pub mod scheduler;
pub mod utils;
