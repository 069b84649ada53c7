//! Endpoint registration and governed execution.
//!
//! 1. **Registration** (`router`, `listener`): path patterns and socket
//!    events mapped to endpoint configurations
//! 2. **Application** (`application`): mounts, namespaces and dispatch
//! 3. **Middleware** (`middleware`): Tower layers (load shedding, metrics)
//! 4. **Execution** (`executor`): auth, rate limit, acquire, run, release
//! 5. **Load** (`load`): scheduler lag sampling and admission
//! 6. **Background workers** (`worker`): periodic tasks

pub mod application;
pub mod config;
pub mod events;
pub mod executor;
pub mod listener;
pub mod load;
pub mod middleware;
pub mod router;
pub mod worker;

// Re-export key types for convenient access.
pub use application::{
    Application, ApplicationBuilder, HttpRequest, RegistrationError, SocketSession,
};
pub use config::{DispatchConfig, LoadConfig};
pub use events::{AppEvent, ErrorEvent, EventBus};
pub use executor::{Collaborators, Envelope, Executor, Invocation, Reply, Stage};
pub use listener::SocketListener;
pub use load::{Admission, LoadController};
pub use router::{CorsPolicy, PathPattern, Preflight, RouteConfig, RouteMatch, Router};
pub use worker::{BackgroundRunnable, BackgroundWorker};
