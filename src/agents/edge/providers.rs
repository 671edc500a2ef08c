//! Cloud Provider Adapters
//!
//! Trait-based seams between the pipeline components and the target account.
//! Each component depends only on the narrow API it owns.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

use super::policy::PolicyDocument;
use super::rewrite::RewriteRule;
use super::types::{
    AccessIdentity, CertificateRecord, DistributionConfig, EdgeDistribution, EdgeFunction,
    HostedZone, ObjectOwnership, ObjectSummary, OriginStore, PublicAccessBlock, RecordSet,
    RecordType, StoredObject,
};

/// Hosted zone discovery
#[async_trait]
pub trait ZoneApi: Send + Sync {
    async fn list_hosted_zones(&self) -> Result<Vec<HostedZone>>;
}

/// Record set management inside a zone
#[async_trait]
pub trait RecordApi: Send + Sync {
    /// All record sets with exactly this name
    async fn list_record_sets(&self, zone_id: &str, name: &str) -> Result<Vec<RecordSet>>;

    /// Create or replace the record set identified by (name, type)
    async fn upsert_record_set(&self, zone_id: &str, record: &RecordSet) -> Result<()>;

    async fn delete_record_set(&self, zone_id: &str, name: &str, record_type: RecordType)
        -> Result<()>;
}

/// Certificate authority
#[async_trait]
pub trait CertificateApi: Send + Sync {
    async fn list_certificates(&self) -> Result<Vec<CertificateRecord>>;

    /// Request a DNS-validated certificate, returning its id
    async fn request_certificate(
        &self,
        domain: &str,
        alternative_names: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<String>;

    async fn describe_certificate(&self, id: &str) -> Result<CertificateRecord>;

    /// Fails while any distribution still references the certificate
    async fn delete_certificate(&self, id: &str) -> Result<()>;
}

/// Object store
#[async_trait]
pub trait StoreApi: Send + Sync {
    async fn get_store(&self, name: &str) -> Result<Option<OriginStore>>;
    async fn create_store(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<OriginStore>;
    async fn put_public_access_block(&self, name: &str, block: &PublicAccessBlock) -> Result<()>;
    async fn put_ownership(&self, name: &str, ownership: ObjectOwnership) -> Result<()>;
    async fn put_versioning(&self, name: &str, enabled: bool) -> Result<()>;
    async fn put_tags(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    async fn get_policy(&self, name: &str) -> Result<Option<PolicyDocument>>;
    async fn put_policy(&self, name: &str, policy: &PolicyDocument) -> Result<()>;

    async fn list_objects(&self, name: &str) -> Result<Vec<ObjectSummary>>;
    async fn put_object(&self, name: &str, object: StoredObject) -> Result<()>;
    async fn delete_object(&self, name: &str, key: &str) -> Result<()>;
}

/// Edge distribution tier
#[async_trait]
pub trait EdgeApi: Send + Sync {
    async fn find_access_identity(&self, name: &str) -> Result<Option<AccessIdentity>>;
    async fn create_access_identity(&self, name: &str, description: &str) -> Result<AccessIdentity>;

    async fn get_function(&self, name: &str) -> Result<Option<EdgeFunction>>;
    /// Create or replace a viewer-request function and publish it live
    async fn publish_function(&self, name: &str, rule: &RewriteRule) -> Result<EdgeFunction>;

    async fn find_distribution(&self, caller_reference: &str) -> Result<Option<EdgeDistribution>>;
    async fn create_distribution(&self, config: &DistributionConfig) -> Result<EdgeDistribution>;
    /// Update in place; the distribution id never changes
    async fn update_distribution(&self, id: &str, config: &DistributionConfig)
        -> Result<EdgeDistribution>;

    /// Returns the invalidation id
    async fn create_invalidation(&self, distribution_id: &str, paths: &[String]) -> Result<String>;
}

/// A full target account
pub trait CloudBackend: ZoneApi + RecordApi + CertificateApi + StoreApi + EdgeApi {}

impl<T> CloudBackend for T where T: ZoneApi + RecordApi + CertificateApi + StoreApi + EdgeApi {}
