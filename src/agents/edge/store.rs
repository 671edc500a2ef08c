//! Origin Store Binder
//!
//! Creates the private origin store on first run and re-asserts its
//! hardening on every run: all four public-access blocks on, owner-enforced
//! object ownership, versioning enabled, tags as declared.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ComponentContext, ConvergeError};
use super::providers::StoreApi;
use super::types::{Action, Component, ObjectOwnership, OriginStore, PublicAccessBlock};

/// A store setting that differs from the hardened baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDrift {
    PublicAccess,
    Ownership,
    Versioning,
    Tags,
}

#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub store: OriginStore,
    pub action: Action,
    /// Settings corrected during this run
    pub corrected: Vec<StoreDrift>,
}

pub struct OriginStoreBinder {
    api: Arc<dyn StoreApi>,
}

impl OriginStoreBinder {
    pub fn new(api: Arc<dyn StoreApi>) -> Self {
        Self { api }
    }

    pub async fn ensure_store(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<StoreOutcome, ConvergeError> {
        let (store, mut action) = match self.api.get_store(name).await.within(Component::OriginStore)? {
            Some(store) => (store, Action::Unchanged),
            None => {
                let store = self
                    .api
                    .create_store(name, tags)
                    .await
                    .within(Component::OriginStore)?;
                info!(store = %name, "Created origin store");
                (store, Action::Created)
            }
        };

        let corrected = drift(&store, tags);
        for item in &corrected {
            let result = match item {
                StoreDrift::PublicAccess => self
                    .api
                    .put_public_access_block(name, &PublicAccessBlock::locked())
                    .await,
                StoreDrift::Ownership => self
                    .api
                    .put_ownership(name, ObjectOwnership::BucketOwnerEnforced)
                    .await,
                StoreDrift::Versioning => self.api.put_versioning(name, true).await,
                StoreDrift::Tags => self.api.put_tags(name, tags).await,
            };
            result.within(Component::OriginStore)?;
        }

        if corrected.is_empty() {
            debug!(store = %name, "Origin store already hardened");
        } else {
            info!(store = %name, corrected = ?corrected, "Corrected origin store settings");
            if action == Action::Unchanged {
                action = Action::Updated;
            }
        }

        let store = if corrected.is_empty() {
            store
        } else {
            self.api
                .get_store(name)
                .await
                .within(Component::OriginStore)?
                .ok_or_else(|| {
                    ConvergeError::provisioning(
                        Component::OriginStore,
                        anyhow::anyhow!("store {} disappeared while being configured", name),
                    )
                })?
        };

        Ok(StoreOutcome {
            store,
            action,
            corrected,
        })
    }
}

/// Settings of `store` that differ from the hardened baseline
pub fn drift(store: &OriginStore, tags: &BTreeMap<String, String>) -> Vec<StoreDrift> {
    let mut drift = Vec::new();
    if !store.public_access_block.is_locked() {
        drift.push(StoreDrift::PublicAccess);
    }
    if store.ownership != ObjectOwnership::BucketOwnerEnforced {
        drift.push(StoreDrift::Ownership);
    }
    if !store.versioning {
        drift.push(StoreDrift::Versioning);
    }
    if &store.tags != tags {
        drift.push(StoreDrift::Tags);
    }
    drift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::edge::memory::InMemoryCloud;

    fn tags() -> BTreeMap<String, String> {
        BTreeMap::from([("env".to_string(), "prod".to_string())])
    }

    #[test]
    fn test_drift_detection() {
        let mut store = OriginStore {
            name: "example.test".to_string(),
            arn: "arn:aws:s3:::example.test".to_string(),
            regional_domain: "example.test.s3.us-east-1.amazonaws.com".to_string(),
            public_access_block: PublicAccessBlock::locked(),
            ownership: ObjectOwnership::BucketOwnerEnforced,
            versioning: true,
            tags: tags(),
        };
        assert!(drift(&store, &tags()).is_empty());

        store.public_access_block.restrict_public_buckets = false;
        store.versioning = false;
        assert_eq!(
            drift(&store, &BTreeMap::new()),
            vec![StoreDrift::PublicAccess, StoreDrift::Versioning, StoreDrift::Tags]
        );
    }

    #[tokio::test]
    async fn test_create_then_idempotent() {
        let cloud = Arc::new(InMemoryCloud::new());
        let binder = OriginStoreBinder::new(cloud.clone());

        let first = binder.ensure_store("example.test", &tags()).await.unwrap();
        assert_eq!(first.action, Action::Created);
        assert!(first.store.public_access_block.is_locked());
        assert_eq!(first.store.ownership, ObjectOwnership::BucketOwnerEnforced);
        assert!(first.store.versioning);

        let second = binder.ensure_store("example.test", &tags()).await.unwrap();
        assert_eq!(second.action, Action::Unchanged);
        assert!(second.corrected.is_empty());
        assert_eq!(second.store, first.store);
    }

    #[tokio::test]
    async fn test_reasserts_hardening_after_drift() {
        let cloud = Arc::new(InMemoryCloud::new());
        let binder = OriginStoreBinder::new(cloud.clone());
        binder.ensure_store("example.test", &tags()).await.unwrap();

        cloud
            .put_public_access_block("example.test", &PublicAccessBlock::default())
            .await
            .unwrap();
        cloud
            .put_ownership("example.test", ObjectOwnership::ObjectWriter)
            .await
            .unwrap();

        let outcome = binder.ensure_store("example.test", &tags()).await.unwrap();
        assert_eq!(outcome.action, Action::Updated);
        assert_eq!(
            outcome.corrected,
            vec![StoreDrift::PublicAccess, StoreDrift::Ownership]
        );
        assert!(outcome.store.public_access_block.is_locked());
    }
}
