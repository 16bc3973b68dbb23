//! Payload Resolvers
//!
//! Each job type has one resolver turning `(entity_id, extra)` into the
//! payload a runner receives. The dispatcher never looks inside `extra`; its
//! shape belongs to the resolver of the job's type.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use conveyor_core::domain::job::JobType;
use serde_json::Value;

#[async_trait]
pub trait PayloadResolver: Send + Sync {
    async fn resolve(&self, entity_id: i64, extra: Option<Value>) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> PayloadResolver for F
where
    F: Fn(i64, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn resolve(&self, entity_id: i64, extra: Option<Value>) -> anyhow::Result<Value> {
        (self)(entity_id, extra).await
    }
}

/// Job type to resolver map, injected into the dispatcher
#[derive(Default)]
pub struct PayloadResolverRegistry {
    resolvers: RwLock<HashMap<JobType, Arc<dyn PayloadResolver>>>,
}

impl std::fmt::Debug for PayloadResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadResolverRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl PayloadResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the resolver for `job_type`.
    ///
    /// Registering a type twice replaces the earlier resolver and logs a
    /// warning.
    pub fn register(&self, job_type: JobType, resolver: impl PayloadResolver + 'static) {
        let mut resolvers = self.resolvers.write().unwrap_or_else(|e| e.into_inner());
        if resolvers.insert(job_type, Arc::new(resolver)).is_some() {
            tracing::warn!(
                "Payload resolver for job type {} has already been registered",
                job_type
            );
        } else {
            tracing::info!("Payload resolver for job type {} registered", job_type);
        }
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn PayloadResolver>> {
        self.resolvers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_type)
            .cloned()
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.get(job_type).is_some()
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self
            .resolvers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        types.sort();
        types
    }

    /// Resolve the payload of a job of `job_type`.
    pub async fn resolve(
        &self,
        job_type: JobType,
        entity_id: i64,
        extra: Option<Value>,
    ) -> anyhow::Result<Value> {
        let resolver = self
            .get(job_type)
            .ok_or_else(|| anyhow::anyhow!("no payload resolver for job type {job_type}"))?;
        resolver.resolve(entity_id, extra).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_closure_resolver() {
        let registry = PayloadResolverRegistry::new();
        registry.register(JobType::LabPing, |entity_id: i64, _extra: Option<Value>| async move {
            Ok::<_, anyhow::Error>(json!({ "ping": entity_id }))
        });

        let payload = registry.resolve(JobType::LabPing, 9, None).await.unwrap();
        assert_eq!(payload, json!({ "ping": 9 }));
    }

    #[tokio::test]
    async fn test_duplicate_registration_replaces() {
        let registry = PayloadResolverRegistry::new();
        registry.register(JobType::LabPing, |_: i64, _: Option<Value>| async {
            Ok::<_, anyhow::Error>(json!("first"))
        });
        registry.register(JobType::LabPing, |_: i64, _: Option<Value>| async {
            Ok::<_, anyhow::Error>(json!("second"))
        });

        assert_eq!(registry.job_types(), vec![JobType::LabPing]);
        assert_eq!(
            registry.resolve(JobType::LabPing, 1, None).await.unwrap(),
            json!("second")
        );
    }

    #[tokio::test]
    async fn test_missing_resolver_is_an_error() {
        let registry = PayloadResolverRegistry::new();
        assert!(registry.resolve(JobType::SourceAnalyze, 1, None).await.is_err());
    }
}
