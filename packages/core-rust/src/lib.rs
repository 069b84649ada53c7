//! Switchyard Core: error taxonomy, endpoint configuration, and the
//! collaborator contracts the dispatch pipeline is written against.

pub mod context;
pub mod endpoint;
pub mod error;
pub mod traits;
pub mod types;

pub use context::{ContextParts, ExecutionContext};
pub use endpoint::{
    Action, ActionSpec, Adapter, EndpointConfig, Handler, HandlerConfig, ResponseSpec, ViewOptions,
};
pub use error::{DispatchError, ErrorKind};
pub use traits::{Authenticator, DaoHandle, Database, ErrorReporter, Notifier, Opaque, RateLimiter};
pub use types::{AuthInfo, Credentials, DaoOptions, Inputs, RateOptions, Release};
