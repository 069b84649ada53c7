//! Declarative endpoint configuration.
//!
//! An [`EndpointConfig`] binds an action, plus optional input adapter,
//! response shaping and governance options, to one route or socket event.
//! Each optional field switches on exactly one pipeline stage:
//!
//! | field      | stage enabled                                  |
//! |------------|------------------------------------------------|
//! | `auth`     | extra options for the authenticator            |
//! | `rate`     | rate limiting                                  |
//! | `dao`      | transaction start on resource acquisition      |
//! | `adapter`  | input adaptation (otherwise merged inputs pass)|
//! | `response` | body rendering (otherwise no content)          |

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::DispatchError;
use crate::types::{AuthInfo, DaoOptions, Inputs, RateOptions};

// ---------------------------------------------------------------------------
// Adapter / Action
// ---------------------------------------------------------------------------

/// Turns merged raw inputs (plus auth info) into action inputs.
///
/// Fails with a `DispatchError` (usually a client error) to reject the input.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn adapt(&self, inputs: Inputs, auth: Option<Arc<AuthInfo>>) -> anyhow::Result<Inputs>;
}

#[async_trait]
impl<F, Fut> Adapter for F
where
    F: Fn(Inputs, Option<Arc<AuthInfo>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Inputs>> + Send + 'static,
{
    async fn adapt(&self, inputs: Inputs, auth: Option<Arc<AuthInfo>>) -> anyhow::Result<Inputs> {
        (self)(inputs, auth).await
    }
}

/// The business operation behind an endpoint.
#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(&self, inputs: Inputs, ctx: ExecutionContext) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> Action for F
where
    F: Fn(Inputs, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn execute(&self, inputs: Inputs, ctx: ExecutionContext) -> anyhow::Result<Value> {
        (self)(inputs, ctx).await
    }
}

/// One action, or several keyed by a selector field of the adapted inputs.
#[derive(Clone)]
pub enum ActionSpec {
    Single(Arc<dyn Action>),
    Selector {
        field: String,
        actions: HashMap<String, Arc<dyn Action>>,
    },
}

impl ActionSpec {
    /// Picks the action to run for the given adapted inputs.
    ///
    /// # Errors
    ///
    /// Returns a 400 client error when the selector is missing, not a
    /// string, or names no configured action.
    pub fn resolve(&self, inputs: &Inputs) -> Result<Arc<dyn Action>, DispatchError> {
        match self {
            Self::Single(action) => Ok(Arc::clone(action)),
            Self::Selector { field, actions } => {
                let selector = inputs.get(field).and_then(Value::as_str).ok_or_else(|| {
                    DispatchError::bad_request(format!("Missing action selector {field}"))
                })?;
                actions
                    .get(selector)
                    .cloned()
                    .ok_or_else(|| DispatchError::bad_request(format!("Unknown action {selector}")))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Response shaping
// ---------------------------------------------------------------------------

/// Output of a view: `None` means "nothing to show", `Err` means the value
/// could not be turned into structured data.
type Rendered = Result<Option<Value>, serde_json::Error>;

type TransformFn = dyn Fn(Value) -> Rendered + Send + Sync;
type ViewFn = dyn Fn(Value, &Value) -> Rendered + Send + Sync;
type OptionsFn = dyn Fn(&Value) -> Value + Send + Sync;

/// Options handed to a view: fixed, or computed from the action result.
#[derive(Clone)]
pub enum ViewOptions {
    Static(Value),
    Computed(Arc<OptionsFn>),
}

impl ViewOptions {
    fn resolve(&self, result: &Value) -> Value {
        match self {
            Self::Static(options) => options.clone(),
            Self::Computed(compute) => compute(result),
        }
    }
}

#[derive(Clone)]
enum ResponseKind {
    Transform(Arc<TransformFn>),
    View { view: Arc<ViewFn>, options: ViewOptions },
}

/// How an action result becomes a response body.
#[derive(Clone)]
pub struct ResponseSpec {
    kind: ResponseKind,
}

impl ResponseSpec {
    /// A bare transform from action result to body.
    pub fn transform<F, S>(transform: F) -> Self
    where
        F: Fn(Value) -> Option<S> + Send + Sync + 'static,
        S: Serialize,
    {
        Self {
            kind: ResponseKind::Transform(Arc::new(move |result: Value| {
                transform(result).map(serde_json::to_value).transpose()
            })),
        }
    }

    /// The action result is the body, unchanged.
    #[must_use]
    pub fn identity() -> Self {
        Self::transform(Some::<Value>)
    }

    /// A view with fixed options.
    pub fn view<F, S>(view: F, options: Value) -> Self
    where
        F: Fn(Value, &Value) -> Option<S> + Send + Sync + 'static,
        S: Serialize,
    {
        Self::view_with(view, ViewOptions::Static(options))
    }

    /// A view with options computed from the action result.
    pub fn view_with<F, S>(view: F, options: ViewOptions) -> Self
    where
        F: Fn(Value, &Value) -> Option<S> + Send + Sync + 'static,
        S: Serialize,
    {
        Self {
            kind: ResponseKind::View {
                view: Arc::new(move |result: Value, options: &Value| {
                    view(result, options).map(serde_json::to_value).transpose()
                }),
                options,
            },
        }
    }

    /// Renders an action result into a body.
    ///
    /// # Errors
    ///
    /// - `NotFound` ("Resource not found") when the view produced nothing.
    /// - `UnsupportedMediaType` when the produced value is not JSON encodable.
    pub fn render(&self, result: Value) -> Result<Value, DispatchError> {
        let rendered = match &self.kind {
            ResponseKind::Transform(transform) => transform(result),
            ResponseKind::View { view, options } => {
                let options = options.resolve(&result);
                view(result, &options)
            }
        };
        match rendered {
            Ok(Some(body)) => Ok(body),
            Ok(None) => Err(DispatchError::resource_not_found()),
            Err(err) => Err(DispatchError::UnsupportedMediaType(format!(
                "Response is not JSON encodable: {err}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// EndpointConfig
// ---------------------------------------------------------------------------

/// Declarative binding of an action and its governance options.
///
/// Immutable once registered with a router or listener.
#[derive(Clone)]
pub struct EndpointConfig {
    /// Lowest-priority input values.
    pub defaults: Inputs,
    pub adapter: Option<Arc<dyn Adapter>>,
    pub action: ActionSpec,
    /// `None` renders a no-content success.
    pub response: Option<ResponseSpec>,
    /// Opaque options forwarded to the authenticator.
    pub auth: Option<Value>,
    pub dao: DaoOptions,
    pub rate: Option<RateOptions>,
}

/// Socket handlers share the endpoint configuration shape.
pub type HandlerConfig = EndpointConfig;

impl EndpointConfig {
    pub fn new(action: impl Action + 'static) -> Self {
        Self::from_spec(ActionSpec::Single(Arc::new(action)))
    }

    /// An endpoint dispatching to one of several actions by the string value
    /// of `field` in the adapted inputs.
    pub fn with_actions<I, K>(field: impl Into<String>, actions: I) -> Self
    where
        I: IntoIterator<Item = (K, Arc<dyn Action>)>,
        K: Into<String>,
    {
        Self::from_spec(ActionSpec::Selector {
            field: field.into(),
            actions: actions.into_iter().map(|(k, a)| (k.into(), a)).collect(),
        })
    }

    fn from_spec(action: ActionSpec) -> Self {
        Self {
            defaults: Inputs::new(),
            adapter: None,
            action,
            response: None,
            auth: None,
            dao: DaoOptions::default(),
            rate: None,
        }
    }

    #[must_use]
    pub fn defaults(mut self, defaults: Inputs) -> Self {
        self.defaults = defaults;
        self
    }

    #[must_use]
    pub fn default_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn adapter(mut self, adapter: impl Adapter + 'static) -> Self {
        self.adapter = Some(Arc::new(adapter));
        self
    }

    #[must_use]
    pub fn response(mut self, response: ResponseSpec) -> Self {
        self.response = Some(response);
        self
    }

    #[must_use]
    pub fn auth(mut self, options: Value) -> Self {
        self.auth = Some(options);
        self
    }

    #[must_use]
    pub fn dao(mut self, options: DaoOptions) -> Self {
        self.dao = options;
        self
    }

    #[must_use]
    pub fn rate(mut self, options: RateOptions) -> Self {
        self.rate = Some(options);
        self
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// A registration body: a bare action or a full configuration.
#[derive(Clone)]
pub enum Handler {
    /// A bare action; its result is rendered as the body unchanged.
    Bare(Arc<dyn Action>),
    Structured(Arc<EndpointConfig>),
}

impl Handler {
    pub fn action(action: impl Action + 'static) -> Self {
        Self::Bare(Arc::new(action))
    }

    /// Normalizes either form into a configuration.
    #[must_use]
    pub fn into_config(self) -> Arc<EndpointConfig> {
        match self {
            Self::Bare(action) => Arc::new(
                EndpointConfig::from_spec(ActionSpec::Single(action))
                    .response(ResponseSpec::identity()),
            ),
            Self::Structured(config) => config,
        }
    }
}

impl From<EndpointConfig> for Handler {
    fn from(config: EndpointConfig) -> Self {
        Self::Structured(Arc::new(config))
    }
}

impl From<Arc<EndpointConfig>> for Handler {
    fn from(config: Arc<EndpointConfig>) -> Self {
        Self::Structured(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
