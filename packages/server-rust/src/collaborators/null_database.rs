//! No-op [`Database`] implementation.
//!
//! [`NullDatabase`] hands out handles that accept both commit and rollback
//! without side effects. It is the database used when none is configured,
//! so endpoints that never touch storage need no setup.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use switchyard_core::{DaoHandle, DaoOptions, Database, Release};
use tracing::trace;

/// No-op `Database` for tests and storage-free deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDatabase;

#[async_trait]
impl Database for NullDatabase {
    async fn connect(&self, options: DaoOptions) -> anyhow::Result<Arc<dyn DaoHandle>> {
        Ok(Arc::new(NullDao { options }))
    }
}

/// Handle returned by [`NullDatabase`].
#[derive(Debug)]
pub struct NullDao {
    /// Options the handle was opened with.
    pub options: DaoOptions,
}

#[async_trait]
impl DaoHandle for NullDao {
    async fn release(&self, outcome: Release) -> anyhow::Result<()> {
        trace!(outcome = outcome.as_str(), "null dao released");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handles_accept_both_outcomes() {
        let db = NullDatabase;
        let dao = db.connect(DaoOptions::transactional()).await.unwrap();

        assert!(dao.release(Release::Commit).await.is_ok());
        assert!(dao.release(Release::Rollback).await.is_ok());
    }

    #[tokio::test]
    async fn handle_downcasts_and_keeps_options() {
        let dao = NullDatabase.connect(DaoOptions::transactional()).await.unwrap();
        let null = dao.as_any().downcast_ref::<NullDao>().unwrap();
        assert!(null.options.start_transaction);
    }
}
