//! Account authentication on top of the database queue manager.
//!
//! A consumer of [`dqm_queue::Registry`]: every request names the connection
//! (`database`) it targets and runs its lookups and writes through that
//! connection's tiers. The tables it needs come from the `demo` schema.

pub mod error;
mod queries;
pub mod schema;
pub mod service;
pub mod signing;
mod validate;

pub use error::{reply, AuthError};
pub use schema::{demo_migrations, DEMO_SCHEMA};
pub use service::{
    AuthService, LoginRequest, RegisterRequest, Registered, TokenGrant, MAX_FAILED_ATTEMPTS,
    RATE_LIMIT_WINDOW_SECS, TOKEN_LIFETIME_SECS,
};
