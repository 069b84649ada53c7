//! HTTP endpoint routing: resolves `(method, path)` to an endpoint
//! configuration within one mounted router.
//!
//! A [`Router`] is a table of path patterns, each carrying up to five method
//! handlers and an optional CORS policy. Resolution against a root-relative
//! path distinguishes "no pattern matches" (`NotFound`) from "a pattern
//! matches but not for this method" (`MethodNotAllowed`).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use serde_json::Value;
use switchyard_core::{DispatchError, EndpointConfig, Handler, Inputs};
use tracing::warn;

// ---------------------------------------------------------------------------
// Path normalization
// ---------------------------------------------------------------------------

/// Split a path into its non-empty segments, so `"path"`, `"/path"` and
/// `"/path/"` are equivalent.
#[must_use]
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Canonical `/a/b` form of a path. The root is `/`.
#[must_use]
pub fn normalize(path: &str) -> String {
    join(&segments(path))
}

fn join(parts: &[&str]) -> String {
    let mut out = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum::<usize>().max(1));
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

// ---------------------------------------------------------------------------
// PathPattern
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A route pattern such as `/users/:id/posts`.
///
/// Literal segments match exactly; `:name` segments match any single
/// non-empty segment and bind it under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        let segments = segments(pattern)
            .into_iter()
            .map(|s| match s.strip_prefix(':') {
                Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
                _ => Segment::Literal(s.to_string()),
            })
            .collect();
        Self { segments }
    }

    /// Match concrete path segments, returning the bound parameters.
    #[must_use]
    pub fn matches(&self, path: &[&str]) -> Option<Inputs> {
        if path.len() != self.segments.len() {
            return None;
        }
        let mut params = Inputs::new();
        for (segment, actual) in self.segments.iter().zip(path) {
            match segment {
                Segment::Literal(literal) if literal == actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), Value::String((*actual).to_string()));
                }
            }
        }
        Some(params)
    }

    /// Number of literal segments. More literals means a more specific
    /// pattern, so `/users/me` wins over `/users/:id`.
    fn specificity(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => write!(f, "/{s}")?,
                Segment::Param(name) => write!(f, "/:{name}")?,
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CorsPolicy
// ---------------------------------------------------------------------------

/// Cross-origin policy attached to one path pattern.
#[derive(Debug, Clone, Default)]
pub struct CorsPolicy {
    /// Allowed origins; `"*"` allows any.
    pub origins: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: Option<Duration>,
}

impl CorsPolicy {
    /// Allow every origin.
    #[must_use]
    pub fn any() -> Self {
        Self {
            origins: vec!["*".to_string()],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn origins<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            origins: origins.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    #[must_use]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Value of `Access-Control-Allow-Origin` for a request origin, or
    /// `None` when the origin is not allowed.
    ///
    /// A wildcard policy echoes the origin when credentials are allowed,
    /// since browsers reject `*` together with credentials.
    #[must_use]
    pub fn allow_origin(&self, origin: Option<&str>) -> Option<String> {
        let wildcard = self.origins.iter().any(|o| o == "*");
        match origin {
            Some(origin) if wildcard && self.allow_credentials => Some(origin.to_string()),
            _ if wildcard => Some("*".to_string()),
            Some(origin) if self.origins.iter().any(|o| o == origin) => Some(origin.to_string()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// RouteConfig
// ---------------------------------------------------------------------------

/// Method handlers and CORS policy registered under one path pattern.
#[derive(Clone, Default)]
pub struct RouteConfig {
    handlers: Vec<(Method, Arc<EndpointConfig>)>,
    cors: Option<CorsPolicy>,
}

impl RouteConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(self, handler: impl Into<Handler>) -> Self {
        self.method(Method::GET, handler)
    }

    #[must_use]
    pub fn post(self, handler: impl Into<Handler>) -> Self {
        self.method(Method::POST, handler)
    }

    #[must_use]
    pub fn put(self, handler: impl Into<Handler>) -> Self {
        self.method(Method::PUT, handler)
    }

    #[must_use]
    pub fn patch(self, handler: impl Into<Handler>) -> Self {
        self.method(Method::PATCH, handler)
    }

    #[must_use]
    pub fn delete(self, handler: impl Into<Handler>) -> Self {
        self.method(Method::DELETE, handler)
    }

    #[must_use]
    pub fn cors(mut self, policy: CorsPolicy) -> Self {
        self.cors = Some(policy);
        self
    }

    fn method(mut self, method: Method, handler: impl Into<Handler>) -> Self {
        let config = handler.into().into_config();
        self.handlers.retain(|(m, _)| *m != method);
        self.handlers.push((method, config));
        self
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

struct Route {
    pattern: PathPattern,
    handlers: HashMap<Method, Arc<EndpointConfig>>,
    cors: Option<Arc<CorsPolicy>>,
}

/// Outcome of a successful resolution.
#[derive(Clone)]
pub struct RouteMatch {
    pub endpoint: Arc<EndpointConfig>,
    /// Parameters bound by `:name` segments.
    pub params: Inputs,
    /// `"<METHOD> <full pattern>"`, used in logs and error messages.
    pub label: Arc<str>,
    pub cors: Option<Arc<CorsPolicy>>,
}

/// A matched route answering a CORS preflight.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub policy: Arc<CorsPolicy>,
    pub methods: Vec<Method>,
}

/// A named table of endpoint registrations, mountable at a root path.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    /// Root path the router is mounted at; only used for labels.
    root: Vec<String>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register handlers under a path pattern.
    ///
    /// Re-registering a method for an equivalent pattern replaces the
    /// earlier handler (last write wins) and logs a warning.
    pub fn set(&mut self, pattern: &str, config: RouteConfig) -> &mut Self {
        let pattern = PathPattern::parse(pattern);
        let index = match self.routes.iter().position(|r| r.pattern == pattern) {
            Some(index) => index,
            None => {
                self.routes.push(Route {
                    pattern,
                    handlers: HashMap::new(),
                    cors: None,
                });
                self.routes.len() - 1
            }
        };
        let route = &mut self.routes[index];

        for (method, endpoint) in config.handlers {
            if route.handlers.insert(method.clone(), endpoint).is_some() {
                warn!(%method, pattern = %route.pattern, "route handler re-registered, replacing");
            }
        }
        if let Some(cors) = config.cors {
            route.cors = Some(Arc::new(cors));
        }
        self
    }

    /// Whether any route is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub(crate) fn bind(&mut self, root: &str) {
        self.root = segments(root).into_iter().map(str::to_string).collect();
    }

    /// Resolve a method and root-relative path.
    ///
    /// `request_path` is the full path as the caller sent it and only feeds
    /// error messages.
    ///
    /// # Errors
    ///
    /// - `NotFound` ("Endpoint for <path> does not exist") when no pattern
    ///   matches the path.
    /// - `MethodNotAllowed` when a pattern matches but has no handler for
    ///   `method`.
    pub fn resolve(
        &self,
        method: &Method,
        path: &[&str],
        request_path: &str,
    ) -> Result<RouteMatch, DispatchError> {
        let candidates = self.candidates(path);
        if candidates.is_empty() {
            return Err(DispatchError::endpoint_not_found(request_path));
        }
        candidates
            .into_iter()
            .find_map(|(route, params)| {
                route.handlers.get(method).map(|endpoint| RouteMatch {
                    endpoint: Arc::clone(endpoint),
                    params,
                    label: self.label(method, &route.pattern),
                    cors: route.cors.clone(),
                })
            })
            .ok_or_else(|| DispatchError::MethodNotAllowed {
                method: method.to_string(),
                path: request_path.to_string(),
            })
    }

    /// The CORS policy and allowed methods of the most specific route
    /// matching `path` that has a policy.
    #[must_use]
    pub fn preflight(&self, path: &[&str]) -> Option<Preflight> {
        self.candidates(path).into_iter().find_map(|(route, _)| {
            route.cors.as_ref().map(|policy| {
                let mut methods: Vec<Method> = route.handlers.keys().cloned().collect();
                methods.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                Preflight {
                    policy: Arc::clone(policy),
                    methods,
                }
            })
        })
    }

    /// Matching routes, most specific first, registration order breaking ties.
    fn candidates(&self, path: &[&str]) -> Vec<(&Route, Inputs)> {
        let mut matched: Vec<(&Route, Inputs)> = self
            .routes
            .iter()
            .filter_map(|route| route.pattern.matches(path).map(|params| (route, params)))
            .collect();
        matched.sort_by_key(|(route, _)| std::cmp::Reverse(route.pattern.specificity()));
        matched
    }

    fn label(&self, method: &Method, pattern: &PathPattern) -> Arc<str> {
        let root: Vec<&str> = self.root.iter().map(String::as_str).collect();
        let full = match (root.is_empty(), pattern.segments.is_empty()) {
            (true, _) => pattern.to_string(),
            (false, true) => join(&root),
            (false, false) => format!("{}{pattern}", join(&root)),
        };
        Arc::from(format!("{method} {full}"))
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("root", &join(&self.root.iter().map(String::as_str).collect::<Vec<_>>()))
            .field(
                "patterns",
                &self.routes.iter().map(|r| r.pattern.to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
