//! HTTP management API for meshrelay.
//!
//! Exposes tunnel status, server records and tunnel actions under `/api/v1`.
//! Everything except `/api/v1/health` can be put behind bearer tokens.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
mod state;

pub use auth::AuthTokens;
pub use error::{ApiError, ErrorResponse, Result};
pub use router::build_router;
pub use server::{run, serve, serve_listener, RunOptions};
pub use state::ApiState;
