//! AWS Account Backend
//!
//! Implements the provider traits against a real account: Route 53 for zones
//! and records, ACM for certificates, S3 for the origin store and CloudFront
//! for the edge tier.
//!
//! Certificates are always requested in `us-east-1`, the only region the edge
//! tier reads them from. The origin store lives in the SDK's configured
//! region.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_acm::primitives::DateTime as AwsDateTime;
use aws_sdk_acm::types as acm;
use aws_sdk_cloudfront::primitives::Blob;
use aws_sdk_cloudfront::types as cf;
use aws_sdk_route53::types as r53;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types as s3;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::policy::PolicyDocument;
use super::providers::{CertificateApi, EdgeApi, RecordApi, StoreApi, ZoneApi};
use super::rewrite::RewriteRule;
use super::types::{
    normalize_name, AccessIdentity, AliasTarget, CertificateRecord, CertificateState,
    ChallengeRecord, CustomErrorResponse, DistributionConfig, DistributionStatus,
    EdgeDistribution, EdgeFunction, HostedZone, ObjectOwnership, ObjectSummary, OriginBinding,
    OriginStore, PublicAccessBlock, RecordSet, RecordType, StoredObject, TtlBounds,
    ViewerProtocolPolicy,
};

/// Region the edge tier reads viewer certificates from
pub const EDGE_CERTIFICATE_REGION: &str = "us-east-1";

/// Concurrent HEAD requests when reading object checksums
const HEAD_CONCURRENCY: usize = 16;

/// Connection settings of the AWS backend
#[derive(Debug, Clone, Default)]
pub struct AwsSettings {
    /// Region of the origin store (defaults to the SDK's resolved region)
    pub region: Option<String>,
    /// Endpoint override for every client (e.g. LocalStack)
    pub endpoint: Option<String>,
}

pub struct AwsCloud {
    route53: aws_sdk_route53::Client,
    acm: aws_sdk_acm::Client,
    s3: aws_sdk_s3::Client,
    cloudfront: aws_sdk_cloudfront::Client,
    region: String,
}

impl std::fmt::Debug for AwsCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCloud")
            .field("region", &self.region)
            .finish()
    }
}

impl AwsCloud {
    /// Resolve credentials and region from the environment (profile, env
    /// vars, instance metadata) and build every client
    pub async fn connect(settings: AwsSettings) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;

        let cloud = Self::from_sdk_config(&sdk_config)?;
        info!(region = %cloud.region, endpoint = ?settings.endpoint, "Connected AWS backend");
        Ok(cloud)
    }

    pub fn from_sdk_config(sdk_config: &aws_config::SdkConfig) -> Result<Self> {
        let region = sdk_config
            .region()
            .map(|r| r.to_string())
            .ok_or_else(|| anyhow!("no AWS region configured (set AWS_REGION or --aws-region)"))?;

        let acm_config = aws_sdk_acm::config::Builder::from(sdk_config)
            .region(aws_sdk_acm::config::Region::new(EDGE_CERTIFICATE_REGION))
            .build();

        Ok(Self {
            route53: aws_sdk_route53::Client::new(sdk_config),
            acm: aws_sdk_acm::Client::from_conf(acm_config),
            s3: aws_sdk_s3::Client::new(sdk_config),
            cloudfront: aws_sdk_cloudfront::Client::new(sdk_config),
            region,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// The record set exactly as Route 53 holds it; deletes must match it
    async fn find_route53_record(
        &self,
        zone_id: &str,
        name: &str,
        record_type: RecordType,
    ) -> Result<Option<r53::ResourceRecordSet>> {
        let name = normalize_name(name);
        let out = self
            .route53
            .list_resource_record_sets()
            .hosted_zone_id(zone_id)
            .start_record_name(&name)
            .start_record_type(r53::RrType::from(record_type.to_string().as_str()))
            .max_items(1)
            .send()
            .await
            .with_context(|| format!("ListResourceRecordSets {} {} in {}", record_type, name, zone_id))?;

        Ok(out
            .resource_record_sets()
            .iter()
            .find(|r| normalize_name(r.name()) == name && r.r#type().as_str() == record_type.to_string())
            .cloned())
    }

    async fn change_record(
        &self,
        zone_id: &str,
        action: r53::ChangeAction,
        record: r53::ResourceRecordSet,
    ) -> Result<()> {
        let change = r53::Change::builder()
            .action(action)
            .resource_record_set(record)
            .build()?;
        let batch = r53::ChangeBatch::builder().changes(change).build()?;

        self.route53
            .change_resource_record_sets()
            .hosted_zone_id(zone_id)
            .change_batch(batch)
            .send()
            .await
            .with_context(|| format!("ChangeResourceRecordSets in {}", zone_id))?;
        Ok(())
    }

    async fn object_summary(&self, store: &str, key: String, size: u64) -> Result<ObjectSummary> {
        let head = self
            .s3
            .head_object()
            .bucket(store)
            .key(&key)
            .checksum_mode(s3::ChecksumMode::Enabled)
            .send()
            .await
            .with_context(|| format!("HeadObject {}/{}", store, key))?;

        Ok(ObjectSummary {
            checksum_sha256: head.checksum_sha256().map(str::to_string),
            key,
            size,
        })
    }

    async fn describe_distribution(&self, id: &str) -> Result<EdgeDistribution> {
        let out = self
            .cloudfront
            .get_distribution()
            .id(id)
            .send()
            .await
            .with_context(|| format!("GetDistribution {}", id))?;
        let distribution = out
            .distribution()
            .ok_or_else(|| anyhow!("distribution {} not returned", id))?;
        let tags = self.distribution_tags(distribution.arn()).await?;
        distribution_from_aws(distribution, tags)
    }

    async fn distribution_tags(&self, arn: &str) -> Result<BTreeMap<String, String>> {
        let out = self
            .cloudfront
            .list_tags_for_resource()
            .resource(arn)
            .send()
            .await
            .with_context(|| format!("ListTagsForResource {}", arn))?;

        Ok(out
            .tags()
            .map(|tags| {
                tags.items()
                    .iter()
                    .map(|t| (t.key().to_string(), t.value().unwrap_or_default().to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn sync_distribution_tags(
        &self,
        arn: &str,
        current: &BTreeMap<String, String>,
        desired: &BTreeMap<String, String>,
    ) -> Result<()> {
        let stale: Vec<String> = current
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned()
            .collect();
        if !stale.is_empty() {
            self.cloudfront
                .untag_resource()
                .resource(arn)
                .tag_keys(cf::TagKeys::builder().set_items(Some(stale)).build())
                .send()
                .await
                .with_context(|| format!("UntagResource {}", arn))?;
        }

        if !desired.is_empty() && desired != current {
            self.cloudfront
                .tag_resource()
                .resource(arn)
                .tags(cloudfront_tags(desired)?)
                .send()
                .await
                .with_context(|| format!("TagResource {}", arn))?;
        }
        Ok(())
    }
}

// ============================================================
// Route 53
// ============================================================

#[async_trait]
impl ZoneApi for AwsCloud {
    async fn list_hosted_zones(&self) -> Result<Vec<HostedZone>> {
        let mut zones = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let out = self
                .route53
                .list_hosted_zones()
                .set_marker(marker.take())
                .send()
                .await
                .context("ListHostedZones")?;

            zones.extend(out.hosted_zones().iter().map(|zone| HostedZone {
                id: zone.id().trim_start_matches("/hostedzone/").to_string(),
                name: normalize_name(zone.name()),
                private: zone.config().map(|c| c.private_zone()).unwrap_or(false),
            }));

            match out.next_marker() {
                Some(next) if out.is_truncated() => marker = Some(next.to_string()),
                _ => break,
            }
        }

        debug!(count = zones.len(), "Listed hosted zones");
        Ok(zones)
    }
}

#[async_trait]
impl RecordApi for AwsCloud {
    async fn list_record_sets(&self, zone_id: &str, name: &str) -> Result<Vec<RecordSet>> {
        let name = normalize_name(name);
        let out = self
            .route53
            .list_resource_record_sets()
            .hosted_zone_id(zone_id)
            .start_record_name(&name)
            .max_items(16)
            .send()
            .await
            .with_context(|| format!("ListResourceRecordSets {} in {}", name, zone_id))?;

        Ok(out
            .resource_record_sets()
            .iter()
            .filter(|r| normalize_name(r.name()) == name)
            .filter_map(record_from_aws)
            .collect())
    }

    async fn upsert_record_set(&self, zone_id: &str, record: &RecordSet) -> Result<()> {
        self.change_record(zone_id, r53::ChangeAction::Upsert, record_to_aws(record)?)
            .await?;
        debug!(zone = %zone_id, name = %record.name, record_type = %record.record_type, "Upserted record set");
        Ok(())
    }

    async fn delete_record_set(&self, zone_id: &str, name: &str, record_type: RecordType) -> Result<()> {
        let Some(existing) = self.find_route53_record(zone_id, name, record_type).await? else {
            debug!(zone = %zone_id, name = %name, record_type = %record_type, "Record set already absent");
            return Ok(());
        };
        self.change_record(zone_id, r53::ChangeAction::Delete, existing)
            .await
    }
}

fn record_from_aws(record: &r53::ResourceRecordSet) -> Option<RecordSet> {
    let record_type = match record.r#type().as_str() {
        "A" => RecordType::A,
        "AAAA" => RecordType::AAAA,
        "CNAME" => RecordType::CNAME,
        "TXT" => RecordType::TXT,
        _ => return None,
    };

    let values = record
        .resource_records()
        .iter()
        .map(|r| match record_type {
            RecordType::TXT => txt_decode(r.value()),
            _ => normalize_value(record_type, r.value()),
        })
        .collect();

    Some(RecordSet {
        name: normalize_name(record.name()),
        record_type,
        ttl: record.ttl().and_then(|t| u32::try_from(t).ok()),
        values,
        alias: record.alias_target().map(|a| AliasTarget {
            dns_name: normalize_name(a.dns_name()),
            hosted_zone_id: a.hosted_zone_id().to_string(),
            evaluate_target_health: a.evaluate_target_health(),
        }),
    })
}

fn record_to_aws(record: &RecordSet) -> Result<r53::ResourceRecordSet> {
    let mut builder = r53::ResourceRecordSet::builder()
        .name(&record.name)
        .r#type(r53::RrType::from(record.record_type.to_string().as_str()));

    match &record.alias {
        Some(alias) => {
            builder = builder.alias_target(
                r53::AliasTarget::builder()
                    .hosted_zone_id(&alias.hosted_zone_id)
                    .dns_name(&alias.dns_name)
                    .evaluate_target_health(alias.evaluate_target_health)
                    .build()?,
            );
        }
        None => {
            builder = builder.set_ttl(record.ttl.map(i64::from));
            for value in &record.values {
                let value = match record.record_type {
                    RecordType::TXT => txt_encode(value),
                    _ => value.clone(),
                };
                builder = builder.resource_records(r53::ResourceRecord::builder().value(value).build()?);
            }
        }
    }

    Ok(builder.build()?)
}

/// CNAME targets come back fully qualified
fn normalize_value(record_type: RecordType, value: &str) -> String {
    match record_type {
        RecordType::CNAME => normalize_name(value),
        _ => value.to_string(),
    }
}

/// TXT values are stored as quoted character strings
fn txt_encode(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn txt_decode(value: &str) -> String {
    let inner = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    inner.replace("\\\"", "\"").replace("\\\\", "\\")
}

// ============================================================
// ACM
// ============================================================

#[async_trait]
impl CertificateApi for AwsCloud {
    async fn list_certificates(&self) -> Result<Vec<CertificateRecord>> {
        let mut arns = Vec::new();
        let mut next: Option<String> = None;

        loop {
            let out = self
                .acm
                .list_certificates()
                .set_next_token(next.take())
                .send()
                .await
                .context("ListCertificates")?;

            arns.extend(
                out.certificate_summary_list()
                    .iter()
                    .filter_map(|c| c.certificate_arn())
                    .map(str::to_string),
            );

            match out.next_token() {
                Some(token) => next = Some(token.to_string()),
                None => break,
            }
        }

        let mut certificates = Vec::with_capacity(arns.len());
        for arn in &arns {
            certificates.push(self.describe_certificate(arn).await?);
        }
        Ok(certificates)
    }

    async fn request_certificate(
        &self,
        domain: &str,
        alternative_names: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut request = self
            .acm
            .request_certificate()
            .domain_name(domain)
            .validation_method(acm::ValidationMethod::Dns)
            .idempotency_token(idempotency_token(domain, alternative_names));

        for name in alternative_names {
            request = request.subject_alternative_names(name);
        }
        for (key, value) in tags {
            request = request.tags(acm::Tag::builder().key(key).value(value).build()?);
        }

        let out = request
            .send()
            .await
            .with_context(|| format!("RequestCertificate {}", domain))?;
        out.certificate_arn()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("RequestCertificate {} returned no ARN", domain))
    }

    async fn describe_certificate(&self, id: &str) -> Result<CertificateRecord> {
        let out = self
            .acm
            .describe_certificate()
            .certificate_arn(id)
            .send()
            .await
            .with_context(|| format!("DescribeCertificate {}", id))?;
        let detail = out
            .certificate()
            .ok_or_else(|| anyhow!("certificate {} not returned", id))?;
        Ok(certificate_from_aws(id, detail))
    }

    async fn delete_certificate(&self, id: &str) -> Result<()> {
        self.acm
            .delete_certificate()
            .certificate_arn(id)
            .send()
            .await
            .with_context(|| format!("DeleteCertificate {}", id))?;
        Ok(())
    }
}

fn certificate_from_aws(id: &str, detail: &acm::CertificateDetail) -> CertificateRecord {
    let mut domain_names: Vec<String> = detail.domain_name().map(normalize_name).into_iter().collect();
    for name in detail.subject_alternative_names().iter().map(|n| normalize_name(n)) {
        if !domain_names.contains(&name) {
            domain_names.push(name);
        }
    }

    let options = detail.domain_validation_options();
    // Partial challenge sets would be published and then re-polled forever
    let challenges = if options.iter().all(|o| o.resource_record().is_some()) {
        options
            .iter()
            .filter_map(|o| {
                let record = o.resource_record()?;
                Some(ChallengeRecord {
                    domain: normalize_name(o.domain_name()),
                    name: normalize_name(record.name()),
                    record_type: RecordType::CNAME,
                    value: normalize_name(record.value()),
                })
            })
            .collect()
    } else {
        Vec::new()
    };

    CertificateRecord {
        id: id.to_string(),
        domain_names,
        state: certificate_state(detail.status().map(|s| s.as_str())),
        challenges,
        not_after: detail.not_after().and_then(to_chrono),
        in_use_by: detail.in_use_by().to_vec(),
        created_at: detail.created_at().and_then(to_chrono).unwrap_or_else(Utc::now),
    }
}

fn certificate_state(status: Option<&str>) -> CertificateState {
    match status {
        None | Some("PENDING_VALIDATION") => CertificateState::Pending,
        Some("ISSUED") => CertificateState::Validated,
        Some(_) => CertificateState::Failed,
    }
}

/// Same name set, same token: a retried request returns the same certificate
fn idempotency_token(domain: &str, alternative_names: &[String]) -> String {
    let mut names: Vec<String> = std::iter::once(domain)
        .chain(alternative_names.iter().map(String::as_str))
        .map(normalize_name)
        .collect();
    names.sort();
    names.dedup();
    hex::encode(Sha256::digest(names.join(",").as_bytes()))[..32].to_string()
}

fn to_chrono(value: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

// ============================================================
// S3
// ============================================================

#[async_trait]
impl StoreApi for AwsCloud {
    async fn get_store(&self, name: &str) -> Result<Option<OriginStore>> {
        match self.s3.head_bucket().bucket(name).send().await {
            Ok(_) => {}
            Err(err) if err.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => {
                return Ok(None)
            }
            Err(err) => return Err(err).with_context(|| format!("HeadBucket {}", name)),
        }

        let public_access_block = match self.s3.get_public_access_block().bucket(name).send().await {
            Ok(out) => out
                .public_access_block_configuration()
                .map(|c| PublicAccessBlock {
                    block_public_acls: c.block_public_acls().unwrap_or(false),
                    ignore_public_acls: c.ignore_public_acls().unwrap_or(false),
                    block_public_policy: c.block_public_policy().unwrap_or(false),
                    restrict_public_buckets: c.restrict_public_buckets().unwrap_or(false),
                })
                .unwrap_or_default(),
            Err(err) if err.code() == Some("NoSuchPublicAccessBlockConfiguration") => {
                PublicAccessBlock::default()
            }
            Err(err) => return Err(err).with_context(|| format!("GetPublicAccessBlock {}", name)),
        };

        let ownership = match self.s3.get_bucket_ownership_controls().bucket(name).send().await {
            Ok(out) => out
                .ownership_controls()
                .and_then(|c| c.rules().first())
                .map(|r| ownership_from_aws(r.object_ownership().as_str()))
                .unwrap_or(ObjectOwnership::ObjectWriter),
            Err(err) if err.code() == Some("OwnershipControlsNotFoundError") => ObjectOwnership::ObjectWriter,
            Err(err) => return Err(err).with_context(|| format!("GetBucketOwnershipControls {}", name)),
        };

        let versioning = self
            .s3
            .get_bucket_versioning()
            .bucket(name)
            .send()
            .await
            .with_context(|| format!("GetBucketVersioning {}", name))?
            .status()
            == Some(&s3::BucketVersioningStatus::Enabled);

        let tags = match self.s3.get_bucket_tagging().bucket(name).send().await {
            Ok(out) => out
                .tag_set()
                .iter()
                .map(|t| (t.key().to_string(), t.value().to_string()))
                .collect(),
            Err(err) if err.code() == Some("NoSuchTagSet") => BTreeMap::new(),
            Err(err) => return Err(err).with_context(|| format!("GetBucketTagging {}", name)),
        };

        Ok(Some(OriginStore {
            name: name.to_string(),
            arn: format!("arn:aws:s3:::{}", name),
            regional_domain: format!("{}.s3.{}.amazonaws.com", name, self.region),
            public_access_block,
            ownership,
            versioning,
            tags,
        }))
    }

    async fn create_store(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<OriginStore> {
        let mut request = self.s3.create_bucket().bucket(name);
        // us-east-1 rejects an explicit location constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                s3::CreateBucketConfiguration::builder()
                    .location_constraint(s3::BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .with_context(|| format!("CreateBucket {}", name))?;
        info!(bucket = %name, region = %self.region, "Created bucket");

        if !tags.is_empty() {
            self.put_tags(name, tags).await?;
        }
        self.get_store(name)
            .await?
            .ok_or_else(|| anyhow!("bucket {} missing right after creation", name))
    }

    async fn put_public_access_block(&self, name: &str, block: &PublicAccessBlock) -> Result<()> {
        let config = s3::PublicAccessBlockConfiguration::builder()
            .block_public_acls(block.block_public_acls)
            .ignore_public_acls(block.ignore_public_acls)
            .block_public_policy(block.block_public_policy)
            .restrict_public_buckets(block.restrict_public_buckets)
            .build();

        self.s3
            .put_public_access_block()
            .bucket(name)
            .public_access_block_configuration(config)
            .send()
            .await
            .with_context(|| format!("PutPublicAccessBlock {}", name))?;
        Ok(())
    }

    async fn put_ownership(&self, name: &str, ownership: ObjectOwnership) -> Result<()> {
        let rule = s3::OwnershipControlsRule::builder()
            .object_ownership(s3::ObjectOwnership::from(ownership_name(ownership)))
            .build()?;
        let controls = s3::OwnershipControls::builder().rules(rule).build()?;

        self.s3
            .put_bucket_ownership_controls()
            .bucket(name)
            .ownership_controls(controls)
            .send()
            .await
            .with_context(|| format!("PutBucketOwnershipControls {}", name))?;
        Ok(())
    }

    async fn put_versioning(&self, name: &str, enabled: bool) -> Result<()> {
        let status = if enabled {
            s3::BucketVersioningStatus::Enabled
        } else {
            s3::BucketVersioningStatus::Suspended
        };

        self.s3
            .put_bucket_versioning()
            .bucket(name)
            .versioning_configuration(s3::VersioningConfiguration::builder().status(status).build())
            .send()
            .await
            .with_context(|| format!("PutBucketVersioning {}", name))?;
        Ok(())
    }

    async fn put_tags(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        if tags.is_empty() {
            self.s3
                .delete_bucket_tagging()
                .bucket(name)
                .send()
                .await
                .with_context(|| format!("DeleteBucketTagging {}", name))?;
            return Ok(());
        }

        let tag_set = tags
            .iter()
            .map(|(key, value)| s3::Tag::builder().key(key).value(value).build())
            .collect::<Result<Vec<_>, _>>()?;

        self.s3
            .put_bucket_tagging()
            .bucket(name)
            .tagging(s3::Tagging::builder().set_tag_set(Some(tag_set)).build()?)
            .send()
            .await
            .with_context(|| format!("PutBucketTagging {}", name))?;
        Ok(())
    }

    async fn get_policy(&self, name: &str) -> Result<Option<PolicyDocument>> {
        let out = match self.s3.get_bucket_policy().bucket(name).send().await {
            Ok(out) => out,
            Err(err) if err.code() == Some("NoSuchBucketPolicy") => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("GetBucketPolicy {}", name)),
        };

        out.policy()
            .map(|raw| {
                serde_json::from_str(raw).with_context(|| format!("Failed to parse policy of {}", name))
            })
            .transpose()
    }

    async fn put_policy(&self, name: &str, policy: &PolicyDocument) -> Result<()> {
        self.s3
            .put_bucket_policy()
            .bucket(name)
            .policy(serde_json::to_string(policy)?)
            .send()
            .await
            .with_context(|| format!("PutBucketPolicy {}", name))?;
        Ok(())
    }

    async fn list_objects(&self, name: &str) -> Result<Vec<ObjectSummary>> {
        let mut listed = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let out = self
                .s3
                .list_objects_v2()
                .bucket(name)
                .set_continuation_token(token.take())
                .send()
                .await
                .with_context(|| format!("ListObjectsV2 {}", name))?;

            listed.extend(out.contents().iter().filter_map(|object| {
                let size = object.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0);
                object.key().map(|key| (key.to_string(), size))
            }));

            match out.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }

        stream::iter(listed)
            .map(|(key, size)| self.object_summary(name, key, size))
            .buffered(HEAD_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn put_object(&self, name: &str, object: StoredObject) -> Result<()> {
        let StoredObject {
            key,
            content_type,
            checksum_sha256,
            body,
        } = object;

        self.s3
            .put_object()
            .bucket(name)
            .key(&key)
            .content_type(content_type)
            .checksum_sha256(checksum_sha256)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("PutObject {}/{}", name, key))?;
        Ok(())
    }

    async fn delete_object(&self, name: &str, key: &str) -> Result<()> {
        self.s3
            .delete_object()
            .bucket(name)
            .key(key)
            .send()
            .await
            .with_context(|| format!("DeleteObject {}/{}", name, key))?;
        Ok(())
    }
}

fn ownership_name(ownership: ObjectOwnership) -> &'static str {
    match ownership {
        ObjectOwnership::BucketOwnerEnforced => "BucketOwnerEnforced",
        ObjectOwnership::BucketOwnerPreferred => "BucketOwnerPreferred",
        ObjectOwnership::ObjectWriter => "ObjectWriter",
    }
}

fn ownership_from_aws(value: &str) -> ObjectOwnership {
    match value {
        "BucketOwnerEnforced" => ObjectOwnership::BucketOwnerEnforced,
        "BucketOwnerPreferred" => ObjectOwnership::BucketOwnerPreferred,
        _ => ObjectOwnership::ObjectWriter,
    }
}

// ============================================================
// CloudFront
// ============================================================

#[async_trait]
impl EdgeApi for AwsCloud {
    async fn find_access_identity(&self, name: &str) -> Result<Option<AccessIdentity>> {
        let mut marker: Option<String> = None;

        loop {
            let out = self
                .cloudfront
                .list_origin_access_controls()
                .set_marker(marker.take())
                .send()
                .await
                .context("ListOriginAccessControls")?;
            let Some(list) = out.origin_access_control_list() else {
                return Ok(None);
            };

            if let Some(found) = list.items().iter().find(|c| c.name() == name) {
                return Ok(Some(AccessIdentity {
                    id: found.id().to_string(),
                    name: found.name().to_string(),
                    description: found.description().to_string(),
                    signing_protocol: found.signing_protocol().as_str().to_string(),
                    signing_behavior: found.signing_behavior().as_str().to_string(),
                }));
            }

            match list.next_marker() {
                Some(next) if list.is_truncated() => marker = Some(next.to_string()),
                _ => return Ok(None),
            }
        }
    }

    async fn create_access_identity(&self, name: &str, description: &str) -> Result<AccessIdentity> {
        let config = cf::OriginAccessControlConfig::builder()
            .name(name)
            .description(description)
            .signing_protocol(cf::OriginAccessControlSigningProtocols::from("sigv4"))
            .signing_behavior(cf::OriginAccessControlSigningBehaviors::from("always"))
            .origin_access_control_origin_type(cf::OriginAccessControlOriginTypes::from("s3"))
            .build()?;

        let out = self
            .cloudfront
            .create_origin_access_control()
            .origin_access_control_config(config)
            .send()
            .await
            .with_context(|| format!("CreateOriginAccessControl {}", name))?;
        let created = out
            .origin_access_control()
            .ok_or_else(|| anyhow!("CreateOriginAccessControl {} returned nothing", name))?;

        Ok(AccessIdentity {
            id: created.id().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            signing_protocol: "sigv4".to_string(),
            signing_behavior: "always".to_string(),
        })
    }

    async fn get_function(&self, name: &str) -> Result<Option<EdgeFunction>> {
        let out = match self
            .cloudfront
            .describe_function()
            .name(name)
            .stage(cf::FunctionStage::Live)
            .send()
            .await
        {
            Ok(out) => out,
            Err(err) if err.code() == Some("NoSuchFunctionExists") => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("DescribeFunction {}", name)),
        };

        let Some(summary) = out.function_summary() else {
            return Ok(None);
        };
        let arn = summary
            .function_metadata()
            .map(|m| m.function_arn().to_string())
            .ok_or_else(|| anyhow!("function {} has no metadata", name))?;

        // The rule travels in the function comment; anything else gets republished
        let comment = summary.function_config().map(|c| c.comment()).unwrap_or_default();
        let Ok(rule) = serde_json::from_str::<RewriteRule>(comment) else {
            debug!(function = %name, "Function comment does not describe a rewrite rule");
            return Ok(None);
        };

        Ok(Some(EdgeFunction {
            name: name.to_string(),
            arn,
            code: rule.render_function(),
            rule,
        }))
    }

    async fn publish_function(&self, name: &str, rule: &RewriteRule) -> Result<EdgeFunction> {
        let code = rule.render_function();
        let config = cf::FunctionConfig::builder()
            .comment(serde_json::to_string(rule)?)
            .runtime(cf::FunctionRuntime::from("cloudfront-js-2.0"))
            .build()?;

        let existing = match self
            .cloudfront
            .describe_function()
            .name(name)
            .stage(cf::FunctionStage::Development)
            .send()
            .await
        {
            Ok(out) => out.e_tag().map(str::to_string),
            Err(err) if err.code() == Some("NoSuchFunctionExists") => None,
            Err(err) => return Err(err).with_context(|| format!("DescribeFunction {}", name)),
        };

        let etag = match existing {
            Some(etag) => self
                .cloudfront
                .update_function()
                .name(name)
                .if_match(etag)
                .function_config(config)
                .function_code(Blob::new(code.clone().into_bytes()))
                .send()
                .await
                .with_context(|| format!("UpdateFunction {}", name))?
                .e_tag()
                .map(str::to_string),
            None => self
                .cloudfront
                .create_function()
                .name(name)
                .function_config(config)
                .function_code(Blob::new(code.clone().into_bytes()))
                .send()
                .await
                .with_context(|| format!("CreateFunction {}", name))?
                .e_tag()
                .map(str::to_string),
        }
        .ok_or_else(|| anyhow!("function {} returned no ETag", name))?;

        let out = self
            .cloudfront
            .publish_function()
            .name(name)
            .if_match(etag)
            .send()
            .await
            .with_context(|| format!("PublishFunction {}", name))?;
        let arn = out
            .function_summary()
            .and_then(|s| s.function_metadata())
            .map(|m| m.function_arn().to_string())
            .ok_or_else(|| anyhow!("PublishFunction {} returned no ARN", name))?;

        Ok(EdgeFunction {
            name: name.to_string(),
            arn,
            rule: rule.clone(),
            code,
        })
    }

    async fn find_distribution(&self, caller_reference: &str) -> Result<Option<EdgeDistribution>> {
        let mut marker: Option<String> = None;

        loop {
            let out = self
                .cloudfront
                .list_distributions()
                .set_marker(marker.take())
                .send()
                .await
                .context("ListDistributions")?;
            let Some(list) = out.distribution_list() else {
                return Ok(None);
            };

            // The summary carries no caller reference; narrow by alias or comment first
            for summary in list.items() {
                let aliased = summary
                    .aliases()
                    .map(|a| a.items().iter().any(|n| normalize_name(n) == caller_reference))
                    .unwrap_or(false);
                if !aliased && !summary.comment().contains(caller_reference) {
                    continue;
                }

                let distribution = self.describe_distribution(summary.id()).await?;
                if distribution.config.caller_reference == caller_reference {
                    return Ok(Some(distribution));
                }
            }

            match list.next_marker() {
                Some(next) if list.is_truncated() => marker = Some(next.to_string()),
                _ => return Ok(None),
            }
        }
    }

    async fn create_distribution(&self, config: &DistributionConfig) -> Result<EdgeDistribution> {
        let out = self
            .cloudfront
            .create_distribution()
            .distribution_config(config_to_aws(config)?)
            .send()
            .await
            .with_context(|| format!("CreateDistribution {}", config.caller_reference))?;
        let created = out
            .distribution()
            .ok_or_else(|| anyhow!("CreateDistribution {} returned nothing", config.caller_reference))?;

        self.sync_distribution_tags(created.arn(), &BTreeMap::new(), &config.tags)
            .await?;
        self.describe_distribution(created.id()).await
    }

    async fn update_distribution(&self, id: &str, config: &DistributionConfig) -> Result<EdgeDistribution> {
        let out = self
            .cloudfront
            .get_distribution()
            .id(id)
            .send()
            .await
            .with_context(|| format!("GetDistribution {}", id))?;
        let etag = out
            .e_tag()
            .ok_or_else(|| anyhow!("distribution {} returned no ETag", id))?
            .to_string();
        let arn = out
            .distribution()
            .map(|d| d.arn().to_string())
            .ok_or_else(|| anyhow!("distribution {} not returned", id))?;

        self.cloudfront
            .update_distribution()
            .id(id)
            .if_match(etag)
            .distribution_config(config_to_aws(config)?)
            .send()
            .await
            .with_context(|| format!("UpdateDistribution {}", id))?;

        let current_tags = self.distribution_tags(&arn).await?;
        self.sync_distribution_tags(&arn, &current_tags, &config.tags)
            .await?;
        self.describe_distribution(id).await
    }

    async fn create_invalidation(&self, distribution_id: &str, paths: &[String]) -> Result<String> {
        let batch = cf::InvalidationBatch::builder()
            .paths(
                cf::Paths::builder()
                    .quantity(quantity(paths.len()))
                    .set_items(Some(paths.to_vec()))
                    .build()?,
            )
            .caller_reference(Uuid::new_v4().to_string())
            .build()?;

        let out = self
            .cloudfront
            .create_invalidation()
            .distribution_id(distribution_id)
            .invalidation_batch(batch)
            .send()
            .await
            .with_context(|| format!("CreateInvalidation {}", distribution_id))?;

        out.invalidation()
            .map(|i| i.id().to_string())
            .ok_or_else(|| anyhow!("CreateInvalidation {} returned nothing", distribution_id))
    }
}

fn quantity(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

fn methods(names: &[String]) -> Vec<cf::Method> {
    names.iter().map(|m| cf::Method::from(m.as_str())).collect()
}

fn method_names(methods: &[cf::Method]) -> Vec<String> {
    let mut names: Vec<String> = methods.iter().map(|m| m.as_str().to_string()).collect();
    names.sort();
    names
}

fn protocol_policy_name(policy: ViewerProtocolPolicy) -> &'static str {
    match policy {
        ViewerProtocolPolicy::AllowAll => "allow-all",
        ViewerProtocolPolicy::RedirectToHttps => "redirect-to-https",
        ViewerProtocolPolicy::HttpsOnly => "https-only",
    }
}

fn protocol_policy_from_aws(value: &str) -> ViewerProtocolPolicy {
    match value {
        "redirect-to-https" => ViewerProtocolPolicy::RedirectToHttps,
        "https-only" => ViewerProtocolPolicy::HttpsOnly,
        _ => ViewerProtocolPolicy::AllowAll,
    }
}

fn cloudfront_tags(tags: &BTreeMap<String, String>) -> Result<cf::Tags> {
    let items = tags
        .iter()
        .map(|(key, value)| cf::Tag::builder().key(key).value(value).build())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cf::Tags::builder().set_items(Some(items)).build())
}

/// Translate the desired config into CloudFront's. Tags travel separately.
fn config_to_aws(config: &DistributionConfig) -> Result<cf::DistributionConfig> {
    let origin = cf::Origin::builder()
        .id(&config.origin.origin_id)
        .domain_name(&config.origin.domain_name)
        .origin_access_control_id(&config.origin.access_identity_id)
        // Origin access control replaces the legacy identity, which stays empty
        .s3_origin_config(cf::S3OriginConfig::builder().origin_access_identity("").build())
        .build()?;

    let cached_methods = cf::CachedMethods::builder()
        .quantity(quantity(config.cached_methods.len()))
        .set_items(Some(methods(&config.cached_methods)))
        .build()?;
    let allowed_methods = cf::AllowedMethods::builder()
        .quantity(quantity(config.allowed_methods.len()))
        .set_items(Some(methods(&config.allowed_methods)))
        .cached_methods(cached_methods)
        .build()?;

    let cookies = cf::CookiePreference::builder()
        .forward(cf::ItemSelection::from(if config.forward_cookies { "all" } else { "none" }))
        .build()?;
    let forwarded_values = cf::ForwardedValues::builder()
        .query_string(config.forward_query_string)
        .cookies(cookies)
        .build()?;

    let function = cf::FunctionAssociation::builder()
        .function_arn(&config.viewer_request_function)
        .event_type(cf::EventType::from("viewer-request"))
        .build()?;

    let behavior = cf::DefaultCacheBehavior::builder()
        .target_origin_id(&config.origin.origin_id)
        .viewer_protocol_policy(cf::ViewerProtocolPolicy::from(protocol_policy_name(
            config.viewer_protocol_policy,
        )))
        .allowed_methods(allowed_methods)
        .compress(config.compress)
        .forwarded_values(forwarded_values)
        .min_ttl(ttl_seconds(config.ttl.min))
        .default_ttl(ttl_seconds(config.ttl.default))
        .max_ttl(ttl_seconds(config.ttl.max))
        .function_associations(
            cf::FunctionAssociations::builder()
                .quantity(1)
                .items(function)
                .build()?,
        )
        .build()?;

    let custom_errors = config
        .custom_errors
        .iter()
        .map(|e| {
            cf::CustomErrorResponse::builder()
                .error_code(i32::from(e.error_code))
                .response_page_path(&e.response_page_path)
                .response_code(e.response_code.to_string())
                .error_caching_min_ttl(ttl_seconds(e.error_caching_min_ttl))
                .build()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let certificate = cf::ViewerCertificate::builder()
        .acm_certificate_arn(&config.certificate_id)
        .ssl_support_method(cf::SslSupportMethod::from(config.ssl_support_method.as_str()))
        .minimum_protocol_version(cf::MinimumProtocolVersion::from(
            config.minimum_protocol_version.as_str(),
        ))
        .cloud_front_default_certificate(false)
        .build();

    Ok(cf::DistributionConfig::builder()
        .caller_reference(&config.caller_reference)
        .comment(&config.comment)
        .enabled(config.enabled)
        .aliases(
            cf::Aliases::builder()
                .quantity(quantity(config.aliases.len()))
                .set_items(Some(config.aliases.clone()))
                .build()?,
        )
        .origins(cf::Origins::builder().quantity(1).items(origin).build()?)
        .default_cache_behavior(behavior)
        .custom_error_responses(
            cf::CustomErrorResponses::builder()
                .quantity(quantity(custom_errors.len()))
                .set_items(Some(custom_errors))
                .build()?,
        )
        .default_root_object(&config.default_root_object)
        .viewer_certificate(certificate)
        .is_ipv6_enabled(config.ipv6_enabled)
        .http_version(cf::HttpVersion::from(config.http_version.as_str()))
        .price_class(cf::PriceClass::from(config.price_class.as_str()))
        .build()?)
}

fn ttl_seconds(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn seconds(value: Option<i64>) -> u64 {
    value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

/// Read CloudFront's config back into the shape the engine compares against
fn config_from_aws(config: &cf::DistributionConfig, tags: BTreeMap<String, String>) -> Result<DistributionConfig> {
    let origin = config
        .origins()
        .and_then(|o| o.items().first())
        .ok_or_else(|| anyhow!("distribution {} has no origin", config.caller_reference()))?;
    let behavior = config
        .default_cache_behavior()
        .ok_or_else(|| anyhow!("distribution {} has no default behavior", config.caller_reference()))?;
    let allowed = behavior.allowed_methods();
    let forwarded = behavior.forwarded_values();
    let certificate = config.viewer_certificate();

    let mut aliases: Vec<String> = config
        .aliases()
        .map(|a| a.items().iter().map(|n| normalize_name(n)).collect())
        .unwrap_or_default();
    aliases.sort();

    Ok(DistributionConfig {
        caller_reference: config.caller_reference().to_string(),
        comment: config.comment().to_string(),
        enabled: config.enabled(),
        aliases,
        origin: OriginBinding {
            origin_id: origin.id().to_string(),
            domain_name: origin.domain_name().to_string(),
            access_identity_id: origin.origin_access_control_id().unwrap_or_default().to_string(),
        },
        certificate_id: certificate
            .and_then(|c| c.acm_certificate_arn())
            .unwrap_or_default()
            .to_string(),
        minimum_protocol_version: certificate
            .and_then(|c| c.minimum_protocol_version())
            .map(|v| v.as_str().to_string())
            .unwrap_or_default(),
        ssl_support_method: certificate
            .and_then(|c| c.ssl_support_method())
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
        viewer_protocol_policy: protocol_policy_from_aws(behavior.viewer_protocol_policy().as_str()),
        allowed_methods: allowed.map(|m| method_names(m.items())).unwrap_or_default(),
        cached_methods: allowed
            .and_then(|m| m.cached_methods())
            .map(|c| method_names(c.items()))
            .unwrap_or_default(),
        compress: behavior.compress().unwrap_or(false),
        forward_query_string: forwarded.map(|f| f.query_string()).unwrap_or(false),
        forward_cookies: forwarded
            .and_then(|f| f.cookies())
            .map(|c| c.forward().as_str() != "none")
            .unwrap_or(false),
        ttl: TtlBounds {
            min: seconds(behavior.min_ttl()),
            default: seconds(behavior.default_ttl()),
            max: seconds(behavior.max_ttl()),
        },
        viewer_request_function: behavior
            .function_associations()
            .and_then(|f| {
                f.items()
                    .iter()
                    .find(|a| a.event_type().as_str() == "viewer-request")
            })
            .map(|a| a.function_arn().to_string())
            .unwrap_or_default(),
        custom_errors: config
            .custom_error_responses()
            .map(|r| {
                r.items()
                    .iter()
                    .map(|e| CustomErrorResponse {
                        error_code: u16::try_from(e.error_code()).unwrap_or(0),
                        response_page_path: e.response_page_path().unwrap_or_default().to_string(),
                        response_code: e.response_code().and_then(|c| c.parse().ok()).unwrap_or(0),
                        error_caching_min_ttl: seconds(e.error_caching_min_ttl()),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        default_root_object: config.default_root_object().unwrap_or_default().to_string(),
        ipv6_enabled: config.is_ipv6_enabled().unwrap_or(false),
        http_version: config
            .http_version()
            .map(|v| v.as_str().to_string())
            .unwrap_or_default(),
        price_class: config
            .price_class()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default(),
        tags,
    })
}

fn distribution_from_aws(
    distribution: &cf::Distribution,
    tags: BTreeMap<String, String>,
) -> Result<EdgeDistribution> {
    let config = distribution
        .distribution_config()
        .ok_or_else(|| anyhow!("distribution {} has no config", distribution.id()))?;

    Ok(EdgeDistribution {
        id: distribution.id().to_string(),
        arn: distribution.arn().to_string(),
        domain_name: normalize_name(distribution.domain_name()),
        status: match distribution.status() {
            "Deployed" => DistributionStatus::Deployed,
            _ => DistributionStatus::InProgress,
        },
        config: config_from_aws(config, tags)?,
    })
}
