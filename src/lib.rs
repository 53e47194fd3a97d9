//! Rust API Gateway - request dispatch core
//!
//! An HTTP API gateway built with Rust, providing pattern-based route
//! matching, service discovery with health sweeping, multi-scope rate
//! limiting, and request forwarding with maintenance mode.

pub mod admin;
pub mod admin_listener;
pub mod config;
pub mod error;
pub mod identity;
pub mod listener;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod route;
