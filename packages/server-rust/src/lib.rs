//! Switchyard Server: path and socket-event routing into a governed
//! execution pipeline, with load shedding and an axum transport.

pub mod collaborators;
pub mod network;
pub mod service;

#[cfg(test)]
mod testing;

pub use collaborators::{FixedWindowLimiter, JwtAuthenticator, NullDatabase};
pub use network::{NetworkConfig, NetworkModule};
pub use service::{
    Application, ApplicationBuilder, CorsPolicy, DispatchConfig, LoadConfig, RouteConfig, Router,
    SocketListener,
};
