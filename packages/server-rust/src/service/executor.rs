//! Governed execution of one endpoint invocation.
//!
//! Stages run strictly in order and any failure short-circuits:
//!
//! 1. **Authenticating**: only when the caller sent credentials
//! 2. **RateChecking**: only when the endpoint has a `rate` option
//! 3. **Acquiring**: connect to the database for a DAO handle
//! 4. **Adapting**: merge inputs and run the optional adapter
//! 5. **Executing**: resolve and run the action
//! 6. **Finalizing**: commit on success, rollback on any failure after 3
//! 7. **Rendering**: shape the body, or reply with no content
//!
//! Once a handle is acquired it is released exactly once, whatever happens.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use switchyard_core::{
    AuthInfo, Authenticator, ContextParts, Credentials, DaoHandle, Database, DispatchError,
    EndpointConfig, ErrorReporter, ExecutionContext, Inputs, Notifier, Opaque, RateLimiter,
    RateOptions, Release,
};
use tokio::time::Instant;
use tower::Service;
use tracing::{debug, trace};

use super::config::DispatchConfig;
use super::events::EventBus;
use crate::collaborators::NullDatabase;

// ---------------------------------------------------------------------------
// Invocation types
// ---------------------------------------------------------------------------

/// Raw inputs of one invocation, before merging.
#[derive(Debug, Clone)]
pub enum Envelope {
    Http {
        path_params: Inputs,
        query: Inputs,
        /// Parsed JSON body, if the request had one.
        body: Option<Value>,
    },
    Event {
        payload: Value,
    },
}

impl Envelope {
    /// Merge into one mapping with ascending precedence
    /// `defaults < query < path params < body` (or `defaults < payload`).
    ///
    /// Object bodies and payloads merge key by key. Any other non-null
    /// value is kept whole under the `body` or `payload` key.
    #[must_use]
    pub fn merge(self, defaults: &Inputs) -> Inputs {
        let mut merged = defaults.clone();
        match self {
            Self::Http {
                path_params,
                query,
                body,
            } => {
                merged.extend(query);
                merged.extend(path_params);
                merge_value(&mut merged, "body", body);
            }
            Self::Event { payload } => merge_value(&mut merged, "payload", Some(payload)),
        }
        merged
    }
}

fn merge_value(into: &mut Inputs, key: &str, value: Option<Value>) {
    match value {
        Some(Value::Object(map)) => into.extend(map),
        None | Some(Value::Null) => {}
        Some(other) => {
            into.insert(key.to_string(), other);
        }
    }
}

/// One request or event, resolved to its endpoint configuration.
#[derive(Clone)]
pub struct Invocation {
    pub endpoint: Arc<EndpointConfig>,
    /// Human-readable endpoint label used in logs and error messages.
    pub label: Arc<str>,
    pub envelope: Envelope,
    pub credentials: Option<Credentials>,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("label", &self.label)
            .field("envelope", &self.envelope)
            .field("has_credentials", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}

/// Successful outcome of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Rendered body.
    Body(Value),
    /// The endpoint has no response configured.
    NoContent,
}

/// Pipeline stage, for logs and timeout diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Authenticating,
    RateChecking,
    Acquiring,
    Adapting,
    Executing,
    Finalizing,
    Rendering,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticating => "authenticating",
            Self::RateChecking => "rate_checking",
            Self::Acquiring => "acquiring",
            Self::Adapting => "adapting",
            Self::Executing => "executing",
            Self::Finalizing => "finalizing",
            Self::Rendering => "rendering",
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Process-wide collaborators shared by all invocations.
#[derive(Clone)]
pub struct Collaborators {
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub database: Arc<dyn Database>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub cache: Option<Opaque>,
    pub dispatcher: Option<Opaque>,
    pub notifier: Option<Arc<dyn Notifier>>,
    /// Settings snapshot exposed to actions.
    pub settings: Arc<Value>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            authenticator: None,
            database: Arc::new(NullDatabase),
            rate_limiter: None,
            cache: None,
            dispatcher: None,
            notifier: None,
            settings: Arc::new(Value::Object(Inputs::new())),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs invocations through the governed pipeline. Cloning is cheap.
#[derive(Clone)]
pub struct Executor {
    collaborators: Arc<Collaborators>,
    events: EventBus,
    timeout: Option<Duration>,
    anonymous_identity: Arc<str>,
}

impl Executor {
    #[must_use]
    pub fn new(collaborators: Arc<Collaborators>, events: EventBus, config: &DispatchConfig) -> Self {
        Self {
            collaborators,
            events,
            timeout: config.invocation_timeout,
            anonymous_identity: Arc::from(config.anonymous_identity.as_str()),
        }
    }

    #[must_use]
    pub fn collaborators(&self) -> &Arc<Collaborators> {
        &self.collaborators
    }

    /// Authenticate a credential pair outside of an invocation, as done when
    /// a socket connects.
    ///
    /// Returns `Ok(None)` when no authenticator is configured.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` carrying the authenticator's message.
    pub async fn authenticate(
        &self,
        credentials: &Credentials,
        options: Option<&Value>,
    ) -> Result<Option<Arc<AuthInfo>>, DispatchError> {
        let deadline = Deadline::start(self.timeout);
        self.run_authentication(credentials, options, deadline).await
    }

    /// Run one invocation end to end.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the first stage that failed.
    pub async fn run(&self, invocation: Invocation) -> Result<Reply, DispatchError> {
        let Invocation {
            endpoint,
            label,
            envelope,
            credentials,
        } = invocation;
        let deadline = Deadline::start(self.timeout);

        trace!(stage = Stage::Authenticating.as_str());
        let auth = match &credentials {
            Some(credentials) => {
                self.run_authentication(credentials, endpoint.auth.as_ref(), deadline)
                    .await?
            }
            None => None,
        };

        if let Some(rate) = &endpoint.rate {
            trace!(stage = Stage::RateChecking.as_str());
            self.check_rate(auth.as_deref(), rate, deadline).await?;
        }

        trace!(stage = Stage::Acquiring.as_str());
        let dao = deadline
            .bound(Stage::Acquiring, self.collaborators.database.connect(endpoint.dao))
            .await?
            .map_err(|err| DispatchError::escalated("Failed to connect to database", err))?;

        let outcome = AssertUnwindSafe(self.adapt_and_execute(
            &endpoint,
            &label,
            envelope,
            auth,
            Arc::clone(&dao),
            deadline,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(DispatchError::escalated(
                format!("Failed to execute {label}"),
                anyhow::anyhow!("panicked: {}", panic_message(panic.as_ref())),
            ))
        });

        trace!(stage = Stage::Finalizing.as_str());
        let result = self.finalize(&label, dao.as_ref(), outcome).await?;

        trace!(stage = Stage::Rendering.as_str());
        match &endpoint.response {
            None => Ok(Reply::NoContent),
            Some(response) => response.render(result).map(Reply::Body),
        }
    }

    async fn run_authentication(
        &self,
        credentials: &Credentials,
        options: Option<&Value>,
        deadline: Deadline,
    ) -> Result<Option<Arc<AuthInfo>>, DispatchError> {
        let Some(authenticator) = &self.collaborators.authenticator else {
            debug!("credentials present but no authenticator configured, skipping");
            return Ok(None);
        };
        let info = deadline
            .bound(
                Stage::Authenticating,
                authenticator.authenticate(credentials, options),
            )
            .await?
            .map_err(unauthorized)?;
        Ok(Some(Arc::new(info)))
    }

    async fn check_rate(
        &self,
        auth: Option<&AuthInfo>,
        rate: &RateOptions,
        deadline: Deadline,
    ) -> Result<(), DispatchError> {
        let Some(limiter) = &self.collaborators.rate_limiter else {
            debug!("endpoint has a rate option but no rate limiter is configured");
            return Ok(());
        };
        let identity = auth.map_or(&*self.anonymous_identity, |info| info.owner.as_str());
        deadline
            .bound(Stage::RateChecking, limiter.try_acquire(identity, rate))
            .await?
            .map_err(|err| match err.downcast::<DispatchError>() {
                Ok(rejection @ DispatchError::TooManyRequests(_)) => rejection,
                Ok(other) => DispatchError::TooManyRequests(other.public_message()),
                Err(err) => {
                    debug!(identity, "rate limiter rejected: {err:#}");
                    DispatchError::TooManyRequests("Rate limit exceeded".to_string())
                }
            })
    }

    /// Stages 4 and 5. Never releases the handle; the caller does.
    async fn adapt_and_execute(
        &self,
        endpoint: &EndpointConfig,
        label: &Arc<str>,
        envelope: Envelope,
        auth: Option<Arc<AuthInfo>>,
        dao: Arc<dyn DaoHandle>,
        deadline: Deadline,
    ) -> Result<Value, DispatchError> {
        trace!(stage = Stage::Adapting.as_str());
        let merged = envelope.merge(&endpoint.defaults);
        let inputs = match &endpoint.adapter {
            Some(adapter) => deadline
                .bound(Stage::Adapting, adapter.adapt(merged, auth.clone()))
                .await?
                .map_err(|err| DispatchError::from_anyhow(err, &format!("adapter for {label}")))?,
            None => merged,
        };

        trace!(stage = Stage::Executing.as_str());
        let action = endpoint.action.resolve(&inputs)?;
        let ctx = ExecutionContext::new(
            Arc::clone(label),
            auth,
            dao,
            self.context_parts(),
            tracing::Span::current(),
        );
        deadline
            .bound(Stage::Executing, action.execute(inputs, ctx))
            .await?
            .map_err(|err| DispatchError::from_anyhow(err, label))
    }

    /// Stage 6: exactly one release per acquired handle.
    async fn finalize(
        &self,
        label: &str,
        dao: &dyn DaoHandle,
        outcome: Result<Value, DispatchError>,
    ) -> Result<Value, DispatchError> {
        match outcome {
            Ok(result) => {
                dao.release(Release::Commit).await.map_err(|err| {
                    DispatchError::escalated(format!("Failed to commit {label}"), err)
                })?;
                Ok(result)
            }
            Err(error) => {
                if let Err(err) = dao.release(Release::Rollback).await {
                    // The caller gets the original failure; the rollback
                    // failure still has to reach operators.
                    self.events.error(
                        label,
                        DispatchError::escalated(format!("Failed to rollback {label}"), err),
                    );
                }
                Err(error)
            }
        }
    }

    fn context_parts(&self) -> ContextParts {
        let reporter: Arc<dyn ErrorReporter> = Arc::new(self.events.clone());
        ContextParts {
            settings: Arc::clone(&self.collaborators.settings),
            cache: self.collaborators.cache.clone(),
            dispatcher: self.collaborators.dispatcher.clone(),
            notifier: self.collaborators.notifier.clone(),
            reporter,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn unauthorized(err: anyhow::Error) -> DispatchError {
    match err.downcast::<DispatchError>() {
        Ok(e @ (DispatchError::Unauthorized(_) | DispatchError::Forbidden(_))) => e,
        Ok(other) => DispatchError::Unauthorized(other.public_message()),
        Err(err) => DispatchError::Unauthorized(err.to_string()),
    }
}

impl Service<Invocation> for Executor {
    type Response = Reply;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Reply, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let executor = self.clone();
        Box::pin(async move { executor.run(invocation).await })
    }
}

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

/// Absolute deadline shared by all stages of one invocation.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Option<(Instant, Duration)>,
}

impl Deadline {
    fn start(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|t| (Instant::now() + t, t)),
        }
    }

    /// Await `fut` unless the deadline passes first.
    async fn bound<F: Future>(&self, stage: Stage, fut: F) -> Result<F::Output, DispatchError> {
        let Some((at, timeout)) = self.at else {
            return Ok(fut.await);
        };
        tokio::time::timeout_at(at, fut).await.map_err(|_elapsed| {
            debug!(stage = stage.as_str(), "invocation deadline expired");
            DispatchError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;
    use switchyard_core::{Action, DaoOptions, ResponseSpec};
    use tower::ServiceExt;

    use super::*;
    use crate::service::events::AppEvent;
    use crate::testing::{CountingLimiter, RecordingDatabase, StaticAuthenticator};

    fn executor_with(collaborators: Collaborators) -> (Executor, EventBus) {
        let events = EventBus::new(32);
        let executor = Executor::new(
            Arc::new(collaborators),
            events.clone(),
            &DispatchConfig::default(),
        );
        (executor, events)
    }

    fn with_db(db: &Arc<RecordingDatabase>) -> Collaborators {
        Collaborators {
            database: Arc::clone(db) as Arc<dyn Database>,
            ..Collaborators::default()
        }
    }

    fn http(path_params: Value, query: Value, body: Option<Value>) -> Envelope {
        let as_map = |v: Value| match v {
            Value::Object(map) => map,
            _ => Inputs::new(),
        };
        Envelope::Http {
            path_params: as_map(path_params),
            query: as_map(query),
            body,
        }
    }

    fn invocation(endpoint: EndpointConfig, envelope: Envelope) -> Invocation {
        Invocation {
            endpoint: Arc::new(endpoint),
            label: Arc::from("POST /:id"),
            envelope,
            credentials: None,
        }
    }

    async fn action_results(_inputs: Inputs, _ctx: ExecutionContext) -> anyhow::Result<Value> {
        Ok(json!({"results": "action results"}))
    }

    async fn echo(inputs: Inputs, _ctx: ExecutionContext) -> anyhow::Result<Value> {
        Ok(Value::Object(inputs))
    }

    async fn explode(_inputs: Inputs, _ctx: ExecutionContext) -> anyhow::Result<Value> {
        anyhow::bail!("database row locked")
    }

    async fn crash(_inputs: Inputs, _ctx: ExecutionContext) -> anyhow::Result<Value> {
        panic!("bug in action")
    }

    #[tokio::test]
    async fn no_response_config_yields_no_content_and_commits() {
        let db = RecordingDatabase::new();
        let (executor, _) = executor_with(with_db(&db));

        let reply = executor
            .run(invocation(
                EndpointConfig::new(action_results),
                http(json!({"id": "12345"}), json!({}), None),
            ))
            .await
            .unwrap();

        assert_eq!(reply, Reply::NoContent);
        assert_eq!(db.releases(), vec![Release::Commit]);
    }

    #[tokio::test]
    async fn response_transform_renders_body() {
        let db = RecordingDatabase::new();
        let (executor, _) = executor_with(with_db(&db));
        let endpoint = EndpointConfig::new(action_results)
            .response(ResponseSpec::transform(|r: Value| Some(r["results"].clone())));

        let reply = executor
            .run(invocation(endpoint, http(json!({}), json!({}), None)))
            .await
            .unwrap();

        assert_eq!(reply, Reply::Body(json!("action results")));
    }

    #[tokio::test]
    async fn inputs_merge_with_ascending_precedence() {
        let (executor, _) = executor_with(Collaborators::default());
        let endpoint = EndpointConfig::new(echo)
            .default_input("a", json!("default"))
            .default_input("b", json!("default"))
            .default_input("c", json!("default"))
            .default_input("d", json!("default"))
            .response(ResponseSpec::identity());
        let envelope = http(
            json!({"c": "path", "d": "path"}),
            json!({"b": "query", "c": "query", "d": "query"}),
            Some(json!({"d": "body"})),
        );

        let Reply::Body(body) = executor.run(invocation(endpoint, envelope)).await.unwrap() else {
            panic!("expected a body");
        };
        assert_eq!(
            body,
            json!({"a": "default", "b": "query", "c": "path", "d": "body"})
        );
    }

    #[test]
    fn scalar_payload_is_kept_under_payload_key() {
        let merged = Envelope::Event { payload: json!(42) }.merge(&Inputs::new());
        assert_eq!(merged["payload"], json!(42));
        let merged = Envelope::Event { payload: Value::Null }.merge(&Inputs::new());
        assert!(merged.is_empty());
    }

    #[tokio::test]
    async fn action_failure_rolls_back_and_hides_cause() {
        let db = RecordingDatabase::new();
        let (executor, _) = executor_with(with_db(&db));

        let err = executor
            .run(invocation(
                EndpointConfig::new(explode),
                http(json!({}), json!({}), None),
            ))
            .await
            .unwrap_err();

        assert_eq!(err.status(), 500);
        assert_eq!(err.public_message(), "Failed to execute POST /:id");
        assert!(err.diagnostic().to_string().contains("database row locked"));
        assert_eq!(db.releases(), vec![Release::Rollback]);
    }

    #[tokio::test]
    async fn panicking_action_rolls_back_once() {
        let db = RecordingDatabase::new();
        let (executor, _) = executor_with(with_db(&db));
        let err = executor
            .run(invocation(
                EndpointConfig::new(crash),
                http(json!({}), json!({}), None),
            ))
            .await
            .unwrap_err();

        assert_eq!(err.status(), 500);
        assert_eq!(err.public_message(), "Failed to execute POST /:id");
        assert!(err.diagnostic().to_string().contains("bug in action"));
        assert_eq!(db.connect_count(), 1);
        assert_eq!(db.releases(), vec![Release::Rollback]);
    }

    #[tokio::test]
    async fn taxonomy_errors_from_actions_pass_through() {
        let db = RecordingDatabase::new();
        let (executor, _) = executor_with(with_db(&db));
        let endpoint = EndpointConfig::new(|_i: Inputs, _c: ExecutionContext| async {
            Err::<Value, _>(DispatchError::Forbidden("Not your record".into()).into())
        });

        let err = executor
            .run(invocation(endpoint, http(json!({}), json!({}), None)))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Forbidden(ref m) if m == "Not your record"));
        assert_eq!(db.releases(), vec![Release::Rollback]);
    }

    #[tokio::test]
    async fn adapter_failure_rolls_back_and_keeps_kind() {
        let db = RecordingDatabase::new();
        let (executor, _) = executor_with(with_db(&db));
        let endpoint = EndpointConfig::new(action_results).adapter(
            |_inputs: Inputs, _auth: Option<Arc<AuthInfo>>| async {
                Err::<Inputs, _>(DispatchError::bad_request("name is required").into())
            },
        );

        let err = executor
            .run(invocation(endpoint, http(json!({}), json!({}), None)))
            .await
            .unwrap_err();

        assert_eq!(err.status(), 400);
        assert_eq!(err.to_string(), "name is required");
        assert_eq!(db.releases(), vec![Release::Rollback]);
    }

    #[tokio::test]
    async fn adapter_output_feeds_the_action() {
        let (executor, _) = executor_with(Collaborators::default());
        let endpoint = EndpointConfig::new(echo)
            .adapter(|mut inputs: Inputs, _auth: Option<Arc<AuthInfo>>| async move {
                inputs.insert("sanitized".into(), json!(true));
                inputs.remove("secret");
                Ok(inputs)
            })
            .response(ResponseSpec::identity());

        let reply = executor
            .run(invocation(
                endpoint,
                http(json!({}), json!({}), Some(json!({"secret": "x", "keep": 1}))),
            ))
            .await
            .unwrap();

        assert_eq!(reply, Reply::Body(json!({"keep": 1, "sanitized": true})));
    }

    #[tokio::test]
    async fn invalid_credentials_fail_before_acquisition() {
        let db = RecordingDatabase::new();
        let auth = StaticAuthenticator::new("good", "user-1");
        let (executor, _) = executor_with(Collaborators {
            authenticator: Some(auth.clone()),
            ..with_db(&db)
        });
        let mut inv = invocation(
            EndpointConfig::new(action_results),
            http(json!({}), json!({}), None),
        );
        inv.credentials = Some(Credentials::new("token", "bad"));

        let err = executor.run(inv).await.unwrap_err();

        assert!(matches!(err, DispatchError::Unauthorized(ref m) if m == "Invalid token"));
        assert_eq!(db.connect_count(), 0);
        assert!(db.releases().is_empty());
    }

    #[tokio::test]
    async fn endpoint_auth_options_reach_the_authenticator() {
        let auth = StaticAuthenticator::new("good", "user-1");
        let (executor, _) = executor_with(Collaborators {
            authenticator: Some(auth.clone()),
            ..Collaborators::default()
        });
        let seen = Arc::new(Mutex::new(None));
        let seen_in_action = Arc::clone(&seen);
        let endpoint = EndpointConfig::new(move |_i: Inputs, ctx: ExecutionContext| {
            let seen = Arc::clone(&seen_in_action);
            async move {
                *seen.lock() = ctx.auth.as_ref().map(|a| a.owner.clone());
                Ok(Value::Null)
            }
        })
        .auth(json!({"scope": "admin"}));
        let mut inv = invocation(endpoint, http(json!({}), json!({}), None));
        inv.credentials = Some(Credentials::new("token", "good"));

        executor.run(inv).await.unwrap();

        assert_eq!(auth.calls.lock().clone(), vec![Some(json!({"scope": "admin"}))]);
        assert_eq!(seen.lock().clone(), Some("user-1".to_string()));
    }

    #[tokio::test]
    async fn missing_credentials_skip_authentication() {
        let auth = StaticAuthenticator::new("good", "user-1");
        let (executor, _) = executor_with(Collaborators {
            authenticator: Some(auth.clone()),
            ..Collaborators::default()
        });
        let endpoint = EndpointConfig::new(|_i: Inputs, ctx: ExecutionContext| async move {
            Ok(json!({ "authenticated": ctx.auth.is_some() }))
        })
        .response(ResponseSpec::identity());

        let reply = executor
            .run(invocation(endpoint, http(json!({}), json!({}), None)))
            .await
            .unwrap();

        assert_eq!(reply, Reply::Body(json!({"authenticated": false})));
        assert_eq!(auth.call_count(), 0);
    }

    #[tokio::test]
    async fn rate_limit_rejection_happens_before_acquisition() {
        let db = RecordingDatabase::new();
        let limiter = CountingLimiter::new(1);
        let (executor, _) = executor_with(Collaborators {
            rate_limiter: Some(limiter.clone()),
            ..with_db(&db)
        });
        let endpoint = EndpointConfig::new(action_results)
            .rate(RateOptions::new(Duration::from_secs(60), 1));
        let inv = invocation(endpoint, http(json!({}), json!({}), None));

        executor.run(inv.clone()).await.unwrap();
        let err = executor.run(inv).await.unwrap_err();

        assert!(matches!(err, DispatchError::TooManyRequests(ref m) if m == "Slow down"));
        assert_eq!(db.connect_count(), 1);
        assert_eq!(limiter.seen.lock().clone(), vec!["anonymous", "anonymous"]);
    }

    #[tokio::test]
    async fn rate_limit_is_keyed_by_authenticated_owner() {
        let limiter = CountingLimiter::new(10);
        let (executor, _) = executor_with(Collaborators {
            authenticator: Some(StaticAuthenticator::new("good", "user-9")),
            rate_limiter: Some(limiter.clone()),
            ..Collaborators::default()
        });
        let endpoint = EndpointConfig::new(action_results)
            .rate(RateOptions::new(Duration::from_secs(1), 10));
        let mut inv = invocation(endpoint, http(json!({}), json!({}), None));
        inv.credentials = Some(Credentials::new("token", "good"));

        executor.run(inv).await.unwrap();

        assert_eq!(limiter.seen.lock().clone(), vec!["user-9"]);
    }

    #[tokio::test]
    async fn dao_policy_is_forwarded_to_connect() {
        let db = RecordingDatabase::new();
        let (executor, _) = executor_with(with_db(&db));
        let endpoint = EndpointConfig::new(action_results).dao(DaoOptions::transactional());

        executor
            .run(invocation(endpoint, http(json!({}), json!({}), None)))
            .await
            .unwrap();
        executor
            .run(invocation(
                EndpointConfig::new(action_results),
                http(json!({}), json!({}), None),
            ))
            .await
            .unwrap();

        let connects = db.connects.lock().clone();
        assert_eq!(
            connects,
            vec![DaoOptions::transactional(), DaoOptions::default()]
        );
    }

    #[tokio::test]
    async fn connect_failure_is_internal_and_releases_nothing() {
        let db = RecordingDatabase::failing_connect();
        let (executor, _) = executor_with(with_db(&db));

        let err = executor
            .run(invocation(
                EndpointConfig::new(action_results),
                http(json!({}), json!({}), None),
            ))
            .await
            .unwrap_err();

        assert_eq!(err.status(), 500);
        assert_eq!(err.public_message(), "Failed to connect to database");
        assert!(db.releases().is_empty());
    }

    #[tokio::test]
    async fn commit_failure_becomes_server_error() {
        let db = RecordingDatabase::failing_release();
        let (executor, _) = executor_with(with_db(&db));

        let err = executor
            .run(invocation(
                EndpointConfig::new(action_results),
                http(json!({}), json!({}), None),
            ))
            .await
            .unwrap_err();

        assert_eq!(err.public_message(), "Failed to commit POST /:id");
        assert_eq!(db.releases(), vec![Release::Commit]);
    }

    #[tokio::test]
    async fn rollback_failure_is_reported_and_original_error_returned() {
        let db = RecordingDatabase::failing_release();
        let (executor, events) = executor_with(with_db(&db));
        let mut rx = events.subscribe();

        let err = executor
            .run(invocation(
                EndpointConfig::new(explode),
                http(json!({}), json!({}), None),
            ))
            .await
            .unwrap_err();

        assert_eq!(err.public_message(), "Failed to execute POST /:id");
        assert_eq!(db.releases(), vec![Release::Rollback]);
        let AppEvent::Error(event) = rx.recv().await.unwrap() else {
            panic!("expected an error event");
        };
        assert_eq!(event.error.public_message(), "Failed to rollback POST /:id");
    }

    #[tokio::test]
    async fn undefined_view_is_not_found_after_commit() {
        let db = RecordingDatabase::new();
        let (executor, _) = executor_with(with_db(&db));
        let endpoint = EndpointConfig::new(action_results)
            .response(ResponseSpec::transform(|_r: Value| None::<Value>));

        let err = executor
            .run(invocation(endpoint, http(json!({}), json!({}), None)))
            .await
            .unwrap_err();

        assert_eq!(err.status(), 404);
        assert_eq!(err.to_string(), "Resource not found");
        assert_eq!(db.releases(), vec![Release::Commit]);
    }

    #[tokio::test]
    async fn unknown_selector_rolls_back_with_client_error() {
        let db = RecordingDatabase::new();
        let (executor, _) = executor_with(with_db(&db));
        let endpoint = EndpointConfig::with_actions(
            "op",
            [("create", Arc::new(action_results) as Arc<dyn Action>)],
        );

        let err = executor
            .run(invocation(
                endpoint,
                http(json!({}), json!({"op": "drop"}), None),
            ))
            .await
            .unwrap_err();

        assert_eq!(err.status(), 400);
        assert_eq!(db.releases(), vec![Release::Rollback]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_rolls_back() {
        let db = RecordingDatabase::new();
        let events = EventBus::new(8);
        let config = DispatchConfig {
            invocation_timeout: Some(Duration::from_millis(100)),
            ..DispatchConfig::default()
        };
        let executor = Executor::new(Arc::new(with_db(&db)), events, &config);
        let endpoint = EndpointConfig::new(|_i: Inputs, _c: ExecutionContext| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        });

        let err = executor
            .run(invocation(endpoint, http(json!({}), json!({}), None)))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Timeout { timeout_ms: 100 }));
        assert_eq!(db.releases(), vec![Release::Rollback]);
    }

    #[tokio::test]
    async fn identical_invocations_render_identical_bodies() {
        let (executor, _) = executor_with(Collaborators::default());
        let endpoint = EndpointConfig::new(echo).response(ResponseSpec::identity());
        let inv = invocation(endpoint, http(json!({"id": "7"}), json!({"q": "x"}), None));

        let first = executor.run(inv.clone()).await.unwrap();
        let second = executor.run(inv).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn executor_is_a_tower_service() {
        let (executor, _) = executor_with(Collaborators::default());
        let reply = executor
            .oneshot(invocation(
                EndpointConfig::new(action_results),
                http(json!({}), json!({}), None),
            ))
            .await
            .unwrap();
        assert_eq!(reply, Reply::NoContent);
    }
}
