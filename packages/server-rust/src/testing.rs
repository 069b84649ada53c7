//! Test doubles for the collaborator contracts.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use switchyard_core::{
    AuthInfo, Authenticator, Credentials, DaoHandle, DaoOptions, Database, DispatchError,
    RateLimiter, RateOptions, Release,
};

// ---------------------------------------------------------------------------
// RecordingDatabase
// ---------------------------------------------------------------------------

/// Database that records every connect and release.
#[derive(Default)]
pub struct RecordingDatabase {
    pub connects: Mutex<Vec<DaoOptions>>,
    pub releases: Arc<Mutex<Vec<Release>>>,
    pub fail_connect: bool,
    pub fail_release: bool,
}

impl RecordingDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_connect() -> Arc<Self> {
        Arc::new(Self {
            fail_connect: true,
            ..Self::default()
        })
    }

    pub fn failing_release() -> Arc<Self> {
        Arc::new(Self {
            fail_release: true,
            ..Self::default()
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn releases(&self) -> Vec<Release> {
        self.releases.lock().clone()
    }
}

#[async_trait]
impl Database for RecordingDatabase {
    async fn connect(&self, options: DaoOptions) -> anyhow::Result<Arc<dyn DaoHandle>> {
        if self.fail_connect {
            anyhow::bail!("connection refused");
        }
        self.connects.lock().push(options);
        Ok(Arc::new(RecordingDao {
            releases: Arc::clone(&self.releases),
            fail_release: self.fail_release,
        }))
    }
}

pub struct RecordingDao {
    releases: Arc<Mutex<Vec<Release>>>,
    fail_release: bool,
}

#[async_trait]
impl DaoHandle for RecordingDao {
    async fn release(&self, outcome: Release) -> anyhow::Result<()> {
        self.releases.lock().push(outcome);
        if self.fail_release {
            anyhow::bail!("release failed");
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// StaticAuthenticator
// ---------------------------------------------------------------------------

/// Accepts exactly one `token <value>` credential and records the options
/// every call was made with.
pub struct StaticAuthenticator {
    pub token: String,
    pub owner: String,
    pub calls: Mutex<Vec<Option<Value>>>,
}

impl StaticAuthenticator {
    pub fn new(token: &str, owner: &str) -> Arc<Self> {
        Arc::new(Self {
            token: token.to_string(),
            owner: owner.to_string(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(
        &self,
        credentials: &Credentials,
        options: Option<&Value>,
    ) -> anyhow::Result<AuthInfo> {
        self.calls.lock().push(options.cloned());
        if !credentials.has_scheme("token") || credentials.credentials != self.token {
            anyhow::bail!("Invalid token");
        }
        Ok(AuthInfo::new(self.owner.clone()).with_claim("role", json!("tester")))
    }
}

// ---------------------------------------------------------------------------
// Rate limiters
// ---------------------------------------------------------------------------

/// Records identities and rejects once `allow` calls have been admitted.
pub struct CountingLimiter {
    pub allow: u32,
    pub seen: Mutex<Vec<String>>,
    admitted: AtomicU32,
}

impl CountingLimiter {
    pub fn new(allow: u32) -> Arc<Self> {
        Arc::new(Self {
            allow,
            seen: Mutex::new(Vec::new()),
            admitted: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl RateLimiter for CountingLimiter {
    async fn try_acquire(&self, identity: &str, _options: &RateOptions) -> anyhow::Result<()> {
        self.seen.lock().push(identity.to_string());
        if self.admitted.fetch_add(1, Ordering::SeqCst) >= self.allow {
            return Err(DispatchError::TooManyRequests("Slow down".to_string()).into());
        }
        Ok(())
    }
}
