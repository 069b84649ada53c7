//! In-process collaborator implementations.
//!
//! - [`NullDatabase`]: handles without side effects, the default database
//! - [`FixedWindowLimiter`]: per-identity fixed-window rate limiting
//! - [`JwtAuthenticator`]: HS256 JSON Web Token authentication

pub mod jwt;
pub mod null_database;
pub mod rate_limiter;

pub use jwt::JwtAuthenticator;
pub use null_database::{NullDao, NullDatabase};
pub use rate_limiter::FixedWindowLimiter;
