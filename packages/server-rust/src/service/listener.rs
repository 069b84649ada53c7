//! Socket event registrations for one namespace.

use std::collections::HashMap;
use std::sync::Arc;

use switchyard_core::{EndpointConfig, Handler};
use tracing::warn;

/// A named table of event handlers, mountable at a namespace.
///
/// Event names are matched exactly, never as patterns.
#[derive(Default, Clone)]
pub struct SocketListener {
    handlers: HashMap<String, Arc<EndpointConfig>>,
    /// Options passed to the authenticator when a connection is opened.
    connect_auth: Option<serde_json::Value>,
}

impl SocketListener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for an event. A second registration for the
    /// same name replaces the first and logs a warning.
    pub fn on(&mut self, event: impl Into<String>, handler: impl Into<Handler>) -> &mut Self {
        let event = event.into();
        if self
            .handlers
            .insert(event.clone(), handler.into().into_config())
            .is_some()
        {
            warn!(event, "socket event handler re-registered, replacing");
        }
        self
    }

    /// Authenticator options used for the connect-time check.
    pub fn with_auth(&mut self, options: serde_json::Value) -> &mut Self {
        self.connect_auth = Some(options);
        self
    }

    #[must_use]
    pub fn connect_auth(&self) -> Option<&serde_json::Value> {
        self.connect_auth.as_ref()
    }

    #[must_use]
    pub fn resolve(&self, event: &str) -> Option<Arc<EndpointConfig>> {
        self.handlers.get(event).cloned()
    }

    #[must_use]
    pub fn events(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for SocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketListener")
            .field("events", &self.events())
            .field("connect_auth", &self.connect_auth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use switchyard_core::{ExecutionContext, Inputs};

    use super::*;

    async fn noop(_inputs: Inputs, _ctx: ExecutionContext) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    #[test]
    fn resolves_exact_names_only() {
        let mut listener = SocketListener::new();
        listener.on("chat:message", Handler::action(noop));

        assert!(listener.resolve("chat:message").is_some());
        assert!(listener.resolve("chat:*").is_none());
        assert!(listener.resolve("chat").is_none());
    }

    #[test]
    fn duplicate_registration_overwrites() {
        let mut listener = SocketListener::new();
        listener
            .on("ping", Handler::action(noop))
            .on("ping", EndpointConfig::new(noop).default_input("second", json!(true)));

        let config = listener.resolve("ping").unwrap();
        assert_eq!(config.defaults["second"], json!(true));
        assert_eq!(listener.events(), vec!["ping"]);
    }

    #[test]
    fn connect_auth_options_are_kept() {
        let mut listener = SocketListener::new();
        assert!(listener.connect_auth().is_none());
        listener.with_auth(json!({"scope": "socket"}));
        assert_eq!(listener.connect_auth(), Some(&json!({"scope": "socket"})));
    }
}
