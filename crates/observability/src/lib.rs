//! Observability infrastructure for CharityFund
//!
//! This crate provides:
//! - Structured logging via tracing
//! - Prometheus metrics
//! - Allocation metric helpers for the funding service
//!
//! # Quick Start
//!
//! ```ignore
//! use observability::{init_logging, LogFormat};
//!
//! init_logging("cfund", LogFormat::Pretty)?;
//!
//! // Optional Prometheus endpoint
//! observability::metrics::init_metrics(9090)?;
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat};
pub use metrics::{init_metrics, FundingMetrics};
