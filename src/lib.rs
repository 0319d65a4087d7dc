//! Quotagate - Per-Caller Quota Enforcement
//!
//! This crate implements fixed-window rate limiting with optional hard
//! blocking. Counters live in a shared store and every check-and-consume is a
//! single atomic transaction per key, so several instances can enforce one
//! quota. The limiter is exposed as a tower middleware and as a gRPC service.

pub mod clock;
pub mod config;
pub mod error;
pub mod grpc;
pub mod middleware;
pub mod ratelimit;
pub mod store;
