//! Process-wide composition root.
//!
//! [`ApplicationBuilder`] collects collaborators, mounted routers and socket
//! listeners. [`ApplicationBuilder::build`] freezes them into an
//! [`Application`], which resolves requests and events, runs them through the
//! invocation pipeline on their own tasks, and reports every failure on the
//! event stream.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use serde_json::Value;
use switchyard_core::{
    AuthInfo, Authenticator, Credentials, Database, DispatchError, Inputs, Notifier, Opaque,
    RateLimiter,
};
use tokio::sync::broadcast;
use tower::ServiceExt;
use tracing::{debug, info, Instrument};

use super::config::DispatchConfig;
use super::events::{AppEvent, EventBus};
use super::executor::{Collaborators, Envelope, Executor, Invocation, Reply};
use super::listener::SocketListener;
use super::load::LoadController;
use super::middleware::{build_invocation_pipeline, InvocationPipeline};
use super::router::{normalize, segments, Preflight, RouteMatch, Router};
use super::worker::BackgroundWorker;

/// Registration-time failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("a router is already mounted at {0}")]
    DuplicateMount(String),
    #[error("a socket listener is already mounted at namespace {0}")]
    DuplicateNamespace(String),
}

// ---------------------------------------------------------------------------
// ApplicationBuilder
// ---------------------------------------------------------------------------

/// Collects everything an [`Application`] is built from.
pub struct ApplicationBuilder {
    config: DispatchConfig,
    collaborators: Collaborators,
    routers: Vec<(Vec<String>, Router)>,
    listeners: HashMap<String, SocketListener>,
}

impl ApplicationBuilder {
    #[must_use]
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            collaborators: Collaborators::default(),
            routers: Vec::new(),
            listeners: HashMap::new(),
        }
    }

    #[must_use]
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.collaborators.authenticator = Some(authenticator);
        self
    }

    /// Defaults to [`NullDatabase`](crate::collaborators::NullDatabase).
    #[must_use]
    pub fn database(mut self, database: Arc<dyn Database>) -> Self {
        self.collaborators.database = database;
        self
    }

    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.collaborators.rate_limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.collaborators.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: Opaque) -> Self {
        self.collaborators.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Opaque) -> Self {
        self.collaborators.dispatcher = Some(dispatcher);
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: Value) -> Self {
        self.collaborators.settings = Arc::new(settings);
        self
    }

    /// Replace all collaborators at once.
    #[must_use]
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Mount a router at a root path. The router is consumed, so one
    /// instance is mounted at most once.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateMount` when another router already owns the root.
    pub fn mount(mut self, root: &str, mut router: Router) -> Result<Self, RegistrationError> {
        let prefix: Vec<String> = segments(root).into_iter().map(str::to_string).collect();
        if self.routers.iter().any(|(existing, _)| *existing == prefix) {
            return Err(RegistrationError::DuplicateMount(normalize(root)));
        }
        router.bind(root);
        self.routers.push((prefix, router));
        Ok(self)
    }

    /// Mount a socket listener at a namespace.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateNamespace` when the namespace is taken.
    pub fn listen(
        mut self,
        namespace: &str,
        listener: SocketListener,
    ) -> Result<Self, RegistrationError> {
        let namespace = normalize(namespace);
        if self.listeners.contains_key(&namespace) {
            return Err(RegistrationError::DuplicateNamespace(namespace));
        }
        self.listeners.insert(namespace, listener);
        Ok(self)
    }

    /// Freeze the registrations. Tables are read-only from here on.
    #[must_use]
    pub fn build(self) -> Application {
        let Self {
            config,
            collaborators,
            mut routers,
            listeners,
        } = self;

        // Longest prefix first so nested mounts take precedence.
        routers.sort_by_key(|(prefix, _)| std::cmp::Reverse(prefix.len()));

        let events = EventBus::new(config.event_capacity);
        let load = Arc::new(LoadController::new(config.load.clone(), events.clone()));
        let executor = Executor::new(Arc::new(collaborators), events.clone(), &config);
        let pipeline = build_invocation_pipeline(executor.clone(), Arc::clone(&load), events.clone());

        info!(
            routers = routers.len(),
            namespaces = listeners.len(),
            "application built"
        );

        Application {
            inner: Arc::new(Inner {
                routers,
                listeners: listeners
                    .into_iter()
                    .map(|(ns, listener)| (ns, Arc::new(listener)))
                    .collect(),
                executor,
                pipeline,
                load,
                events,
            }),
        }
    }
}

impl Default for ApplicationBuilder {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

struct Inner {
    routers: Vec<(Vec<String>, Router)>,
    listeners: HashMap<String, Arc<SocketListener>>,
    executor: Executor,
    pipeline: InvocationPipeline,
    load: Arc<LoadController>,
    events: EventBus,
}

/// A parsed HTTP request, as handed over by the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Inputs,
    pub body: Option<Value>,
    pub credentials: Option<Credentials>,
}

/// The built application. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Application {
    inner: Arc<Inner>,
}

impl Application {
    #[must_use]
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::default()
    }

    /// Subscribe to errors, lag samples and shed notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    #[must_use]
    pub fn load(&self) -> &Arc<LoadController> {
        &self.inner.load
    }

    /// Start sampling scheduler lag. Must run inside a tokio runtime.
    #[must_use]
    pub fn start_load_sampler(&self) -> BackgroundWorker {
        self.inner.load.start_sampler()
    }

    /// Log an error and publish it on the event stream.
    pub fn report(&self, origin: &str, error: DispatchError) {
        self.inner.events.error(origin, error);
    }

    // -- HTTP ---------------------------------------------------------------

    /// Resolve a method and full request path against the mounted routers.
    ///
    /// Mounts are tried longest prefix first; a mount that has no pattern
    /// for the remaining path yields to the next shorter one.
    ///
    /// # Errors
    ///
    /// `NotFound` when no mount has a matching pattern, `MethodNotAllowed`
    /// when the first matching pattern lacks the method.
    pub fn route(&self, method: &Method, path: &str) -> Result<RouteMatch, DispatchError> {
        let parts = segments(path);
        for (prefix, router) in &self.inner.routers {
            let Some(rest) = strip_prefix(&parts, prefix) else {
                continue;
            };
            match router.resolve(method, rest, path) {
                Err(DispatchError::NotFound(_)) => {}
                resolved => return resolved,
            }
        }
        Err(DispatchError::endpoint_not_found(path))
    }

    /// CORS preflight information for a path, if a matching route has a
    /// policy.
    #[must_use]
    pub fn preflight(&self, path: &str) -> Option<Preflight> {
        let parts = segments(path);
        self.inner.routers.iter().find_map(|(prefix, router)| {
            strip_prefix(&parts, prefix).and_then(|rest| router.preflight(rest))
        })
    }

    /// Resolve and run one HTTP request.
    ///
    /// # Errors
    ///
    /// Any resolution or pipeline failure. It has already been reported on
    /// the event stream.
    pub async fn dispatch_http(&self, request: HttpRequest) -> Result<Reply, DispatchError> {
        let route = match self.route(&request.method, &request.path) {
            Ok(route) => route,
            Err(err) => {
                let caller = err.for_caller();
                self.report(&format!("{} {}", request.method, request.path), err);
                return Err(caller);
            }
        };
        self.invoke_route(route, request).await
    }

    /// Run an already resolved HTTP request.
    ///
    /// # Errors
    ///
    /// Any pipeline failure, already reported on the event stream.
    pub async fn invoke_route(
        &self,
        route: RouteMatch,
        request: HttpRequest,
    ) -> Result<Reply, DispatchError> {
        let invocation = Invocation {
            endpoint: route.endpoint,
            label: route.label,
            envelope: Envelope::Http {
                path_params: route.params,
                query: request.query,
                body: request.body,
            },
            credentials: request.credentials,
        };
        self.invoke(invocation).await
    }

    /// Run an invocation through the pipeline on its own task.
    ///
    /// The separate task means a caller that goes away mid-flight cannot
    /// cancel the invocation between acquiring and releasing its handle.
    ///
    /// # Errors
    ///
    /// The pipeline failure, already reported on the event stream.
    pub async fn invoke(&self, invocation: Invocation) -> Result<Reply, DispatchError> {
        let label = Arc::clone(&invocation.label);
        let pipeline = self.inner.pipeline.clone();
        let task = tokio::spawn(
            async move { pipeline.oneshot(invocation).await }.in_current_span(),
        );
        let result = match task.await {
            Ok(result) => result,
            Err(join_error) => Err(DispatchError::escalated(
                format!("Failed to execute {label}"),
                anyhow::Error::new(join_error),
            )),
        };
        result.map_err(|err| self.surface(&label, err))
    }

    /// Report the full error and hand back the caller's copy.
    pub(crate) fn surface(&self, origin: &str, err: DispatchError) -> DispatchError {
        let caller = err.for_caller();
        self.report(origin, err);
        caller
    }

    // -- Sockets ------------------------------------------------------------

    /// Namespaces with a mounted listener.
    #[must_use]
    pub fn namespaces(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inner.listeners.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Open a socket session in a namespace.
    ///
    /// With an authenticator configured, a credential is mandatory and is
    /// checked with the listener's connect options.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown namespace.
    /// - `Unauthorized` ("Authorization header was not provided") when the
    ///   credential is missing, or the authenticator's message when it is
    ///   rejected.
    pub async fn connect_socket(
        &self,
        namespace: &str,
        credentials: Option<Credentials>,
    ) -> Result<SocketSession, DispatchError> {
        let namespace = normalize(namespace);
        self.open_session(&namespace, credentials)
            .await
            .map_err(|err| self.surface(&format!("connect {namespace}"), err))
    }

    async fn open_session(
        &self,
        namespace: &str,
        credentials: Option<Credentials>,
    ) -> Result<SocketSession, DispatchError> {
        let listener = self.inner.listeners.get(namespace).cloned().ok_or_else(|| {
            DispatchError::NotFound(format!("Namespace {namespace} does not exist"))
        })?;

        let auth = if self.inner.executor.collaborators().authenticator.is_some() {
            let credentials = credentials.as_ref().ok_or_else(|| {
                DispatchError::Unauthorized("Authorization header was not provided".to_string())
            })?;
            self.inner
                .executor
                .authenticate(credentials, listener.connect_auth())
                .await?
        } else {
            None
        };

        let session = SocketSession {
            id: uuid::Uuid::new_v4(),
            app: self.clone(),
            namespace: Arc::from(namespace),
            listener,
            credentials,
            auth,
        };
        debug!(session = %session.id, namespace, "socket session opened");
        Ok(session)
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("routers", &self.inner.routers.len())
            .field("namespaces", &self.namespaces())
            .finish_non_exhaustive()
    }
}

fn strip_prefix<'a, 'b>(parts: &'b [&'a str], prefix: &[String]) -> Option<&'b [&'a str]> {
    if parts.len() < prefix.len() {
        return None;
    }
    let (head, rest) = parts.split_at(prefix.len());
    head.iter().zip(prefix).all(|(a, b)| *a == b).then_some(rest)
}

// ---------------------------------------------------------------------------
// SocketSession
// ---------------------------------------------------------------------------

/// One accepted socket connection within a namespace.
///
/// Keeps the connect-time credential; every event re-runs authentication
/// with it and the handler's own options.
#[derive(Clone)]
pub struct SocketSession {
    pub id: uuid::Uuid,
    app: Application,
    namespace: Arc<str>,
    listener: Arc<SocketListener>,
    credentials: Option<Credentials>,
    auth: Option<Arc<AuthInfo>>,
}

impl SocketSession {
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Result of the connect-time authentication.
    #[must_use]
    pub fn auth(&self) -> Option<&Arc<AuthInfo>> {
        self.auth.as_ref()
    }

    /// Run one inbound event. The `Ok` value is the acknowledgment data.
    ///
    /// # Errors
    ///
    /// `NotFound` ("Event <name> is not supported") for an unregistered
    /// event, otherwise any pipeline failure. Both are reported.
    pub async fn dispatch(&self, event: &str, payload: Value) -> Result<Value, DispatchError> {
        let label = format!("{} {event}", self.namespace);
        let Some(endpoint) = self.listener.resolve(event) else {
            let err = DispatchError::NotFound(format!("Event {event} is not supported"));
            return Err(self.app.surface(&label, err));
        };
        let invocation = Invocation {
            endpoint,
            label: Arc::from(label),
            envelope: Envelope::Event { payload },
            credentials: self.credentials.clone(),
        };
        match self.app.invoke(invocation).await? {
            Reply::Body(body) => Ok(body),
            Reply::NoContent => Ok(Value::Null),
        }
    }
}

impl std::fmt::Debug for SocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketSession")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("authenticated", &self.auth.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
