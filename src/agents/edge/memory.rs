//! In-Memory Cloud Account
//!
//! A simulated target account implementing every provider trait. It keeps
//! the account's behaviour where the engine depends on it (certificates in
//! use cannot be deleted, distributions only accept validated certificates,
//! public policies are blocked by the access block) and records every
//! mutation in a journal.
//!
//! State can be persisted to a JSON file so that repeated CLI runs converge
//! against the same account.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::policy::{AccessRequest, Decision, Effect, PolicyDocument};
use super::providers::{CertificateApi, EdgeApi, RecordApi, StoreApi, ZoneApi};
use super::rewrite::{RewriteOutcome, RewriteRule};
use super::types::{
    normalize_name, AccessIdentity, CertificateRecord, CertificateState, ChallengeRecord,
    DistributionConfig, DistributionStatus, EdgeDistribution, EdgeFunction, HostedZone,
    ObjectOwnership, ObjectSummary, OriginStore, PublicAccessBlock, RecordSet, RecordType,
    StoredObject, ViewerProtocolPolicy,
};

const CERTIFICATE_LIFETIME_DAYS: i64 = 395;

/// How the simulated certificate authority answers validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ValidationBehavior {
    /// Validate once the challenges are published and polled this many times
    AutoValidate { after_polls: u32 },
    /// Fail every request once its challenges are published
    Reject,
    /// Leave requests pending forever
    Never,
}

impl Default for ValidationBehavior {
    fn default() -> Self {
        ValidationBehavior::AutoValidate { after_polls: 1 }
    }
}

// ============================================================
// Journal
// ============================================================

/// A single mutation of the account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalKind {
    ZoneAdded { zone_id: String, name: String },
    RecordUpserted { zone_id: String, name: String, record_type: RecordType },
    RecordDeleted { zone_id: String, name: String, record_type: RecordType },
    CertificateRequested { id: String, names: Vec<String> },
    CertificateValidated { id: String },
    CertificateFailed { id: String },
    CertificateDeleted { id: String },
    StoreCreated { name: String },
    StoreConfigured { name: String, setting: String },
    PolicyPut { store: String },
    ObjectPut { store: String, key: String },
    ObjectDeleted { store: String, key: String },
    IdentityCreated { id: String, name: String },
    FunctionPublished { name: String },
    DistributionCreated { id: String, certificate_id: String },
    DistributionUpdated { id: String, certificate_id: String },
    InvalidationCreated { id: String, distribution_id: String, paths: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: JournalKind,
}

// ============================================================
// Account State
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateEntry {
    pub record: CertificateRecord,
    /// Validation polls seen since the challenges were published
    #[serde(default)]
    pub polls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEntry {
    pub store: OriginStore,
    #[serde(default)]
    pub policy: Option<PolicyDocument>,
    #[serde(default)]
    pub objects: BTreeMap<String, StoredObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    pub id: String,
    pub distribution_id: String,
    pub paths: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything the simulated account holds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountState {
    pub account_id: String,
    pub region: String,
    pub validation: ValidationBehavior,
    pub zones: Vec<HostedZone>,
    /// Record sets per zone id
    pub records: BTreeMap<String, Vec<RecordSet>>,
    pub certificates: BTreeMap<String, CertificateEntry>,
    pub stores: BTreeMap<String, StoreEntry>,
    pub identities: Vec<AccessIdentity>,
    pub functions: BTreeMap<String, EdgeFunction>,
    pub distributions: BTreeMap<String, EdgeDistribution>,
    pub invalidations: Vec<Invalidation>,
    pub journal: Vec<JournalEvent>,
}

impl Default for AccountState {
    fn default() -> Self {
        Self {
            account_id: "000000000000".to_string(),
            region: "us-east-1".to_string(),
            validation: ValidationBehavior::default(),
            zones: Vec::new(),
            records: BTreeMap::new(),
            certificates: BTreeMap::new(),
            stores: BTreeMap::new(),
            identities: Vec::new(),
            functions: BTreeMap::new(),
            distributions: BTreeMap::new(),
            invalidations: Vec::new(),
            journal: Vec::new(),
        }
    }
}

impl AccountState {
    fn record(&mut self, kind: JournalKind) {
        let seq = self.journal.len() as u64 + 1;
        debug!(seq, event = ?kind, "Account mutation");
        self.journal.push(JournalEvent {
            seq,
            at: Utc::now(),
            kind,
        });
    }

    fn zone_records(&mut self, zone_id: &str) -> Result<&mut Vec<RecordSet>> {
        if !self.zones.iter().any(|z| z.id == zone_id) {
            bail!("NoSuchHostedZone: {}", zone_id);
        }
        Ok(self.records.entry(zone_id.to_string()).or_default())
    }

    fn store_entry(&mut self, name: &str) -> Result<&mut StoreEntry> {
        self.stores
            .get_mut(name)
            .ok_or_else(|| anyhow!("NoSuchBucket: {}", name))
    }

    /// Distribution ids referencing a certificate
    fn certificate_users(&self, certificate_id: &str) -> Vec<String> {
        self.distributions
            .values()
            .filter(|d| d.config.certificate_id == certificate_id)
            .map(|d| d.id.clone())
            .collect()
    }

    fn certificate_view(&self, entry: &CertificateEntry) -> CertificateRecord {
        let mut record = entry.record.clone();
        record.in_use_by = self.certificate_users(&record.id);
        record
    }

    fn challenge_published(&self, challenge: &ChallengeRecord) -> bool {
        let name = normalize_name(&challenge.name);
        self.records.values().flatten().any(|r| {
            r.name == name && r.record_type == challenge.record_type && r.values.contains(&challenge.value)
        })
    }

    /// Advance a pending certificate according to the validation behaviour
    fn poll_certificate(&mut self, id: &str) -> Result<()> {
        let entry = self
            .certificates
            .get(id)
            .ok_or_else(|| anyhow!("ResourceNotFoundException: certificate {}", id))?;

        if entry.record.state != CertificateState::Pending {
            return Ok(());
        }
        let published = entry
            .record
            .challenges
            .iter()
            .all(|c| self.challenge_published(c));
        if !published {
            return Ok(());
        }

        let behavior = self.validation;
        let mut event = None;
        if let Some(entry) = self.certificates.get_mut(id) {
            match behavior {
                ValidationBehavior::AutoValidate { after_polls } => {
                    entry.polls += 1;
                    if entry.polls >= after_polls {
                        entry.record.state = CertificateState::Validated;
                        entry.record.not_after =
                            Some(Utc::now() + ChronoDuration::days(CERTIFICATE_LIFETIME_DAYS));
                        event = Some(JournalKind::CertificateValidated { id: id.to_string() });
                    }
                }
                ValidationBehavior::Reject => {
                    entry.record.state = CertificateState::Failed;
                    event = Some(JournalKind::CertificateFailed { id: id.to_string() });
                }
                ValidationBehavior::Never => {}
            }
        }

        if let Some(event) = event {
            self.record(event);
        }
        Ok(())
    }

    /// Reject configs the real edge tier would refuse
    fn check_distribution(&self, config: &DistributionConfig, own_id: Option<&str>) -> Result<()> {
        let entry = self
            .certificates
            .get(&config.certificate_id)
            .ok_or_else(|| anyhow!("InvalidViewerCertificate: {} does not exist", config.certificate_id))?;

        if entry.record.state != CertificateState::Validated {
            bail!(
                "InvalidViewerCertificate: {} is {}",
                config.certificate_id,
                entry.record.state
            );
        }

        let covered: Vec<String> = entry.record.domain_names.iter().map(|n| normalize_name(n)).collect();
        if let Some(alias) = config.aliases.iter().find(|a| !covered.contains(&normalize_name(a))) {
            bail!(
                "InvalidViewerCertificate: {} is not covered by {}",
                alias,
                config.certificate_id
            );
        }

        for other in self.distributions.values().filter(|d| Some(d.id.as_str()) != own_id) {
            if let Some(alias) = config.aliases.iter().find(|a| other.config.aliases.contains(a)) {
                bail!("CNAMEAlreadyExists: {} is served by {}", alias, other.id);
            }
            if own_id.is_none() && other.config.caller_reference == config.caller_reference {
                bail!("DistributionAlreadyExists: {}", config.caller_reference);
            }
        }

        if !self
            .identities
            .iter()
            .any(|i| i.id == config.origin.access_identity_id)
        {
            bail!("NoSuchOriginAccessControl: {}", config.origin.access_identity_id);
        }
        if !self.functions.values().any(|f| f.arn == config.viewer_request_function) {
            bail!("NoSuchFunctionExists: {}", config.viewer_request_function);
        }

        Ok(())
    }
}

// ============================================================
// Simulated Account
// ============================================================

/// Response of a simulated viewer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedResponse {
    pub status: u16,
    pub location: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Cache key the request resolved to, `None` when answered at the edge
    pub cache_key: Option<String>,
}

impl SimulatedResponse {
    fn status(status: u16) -> Self {
        Self {
            status,
            location: None,
            content_type: None,
            body: Vec::new(),
            cache_key: None,
        }
    }

    fn redirect(status: u16, location: String) -> Self {
        Self {
            location: Some(location),
            ..Self::status(status)
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

#[derive(Default)]
pub struct InMemoryCloud {
    state: Mutex<AccountState>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validation(behavior: ValidationBehavior) -> Self {
        let cloud = Self::new();
        cloud.set_validation(behavior);
        cloud
    }

    pub fn from_state(state: AccountState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AccountState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load a persisted account, or start empty when the file is missing
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = ?path, "No account state file, starting empty");
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read account state {:?}", path))?;
        let state: AccountState = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse account state {:?}", path))?;
        Ok(Self::from_state(state))
    }

    /// Persist the account atomically (write then rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(&*self.lock())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw).with_context(|| format!("Failed to write {:?}", tmp))?;
        std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
        Ok(())
    }

    pub fn snapshot(&self) -> AccountState {
        self.lock().clone()
    }

    /// Independent copy of the account, for dry runs
    pub fn fork(&self) -> Self {
        Self::from_state(self.snapshot())
    }

    pub fn journal(&self) -> Vec<JournalEvent> {
        self.lock().journal.clone()
    }

    pub fn set_validation(&self, behavior: ValidationBehavior) {
        self.lock().validation = behavior;
    }

    /// Register a hosted zone (zones are created out of band)
    pub fn add_hosted_zone(&self, name: &str, private: bool) -> HostedZone {
        let mut state = self.lock();
        let name = normalize_name(name);

        if let Some(zone) = state.zones.iter().find(|z| z.name == name && z.private == private) {
            return zone.clone();
        }

        let zone = HostedZone {
            id: short_id("Z"),
            name,
            private,
        };
        state.zones.push(zone.clone());
        state.record(JournalKind::ZoneAdded {
            zone_id: zone.id.clone(),
            name: zone.name.clone(),
        });
        zone
    }

    /// Read `key` from `store` the way the edge tier would, signed as
    /// `source_arn`. Returns the HTTP status the origin answers with.
    pub fn origin_read(&self, store: &str, key: &str, source_arn: Option<&str>) -> Result<(u16, Option<StoredObject>)> {
        let state = self.lock();
        origin_read(&state, store, key, source_arn)
    }

    /// Serve `url` through the distribution answering for its host
    pub fn simulate_request(&self, url: &str) -> Result<SimulatedResponse> {
        let state = self.lock();

        let parsed = Url::parse(url).with_context(|| format!("'{}' is not an absolute URL", url))?;
        let scheme = parsed.scheme();
        let host = normalize_name(
            parsed
                .host_str()
                .ok_or_else(|| anyhow!("'{}' has no host", url))?,
        );
        let path = parsed.path();
        let target = match parsed.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path.to_string(),
        };

        let distribution = state
            .distributions
            .values()
            .find(|d| d.config.enabled && d.config.aliases.contains(&host))
            .ok_or_else(|| anyhow!("no distribution serves {}", host))?;
        let config = &distribution.config;

        if scheme == "http" && config.viewer_protocol_policy == ViewerProtocolPolicy::RedirectToHttps {
            return Ok(SimulatedResponse::redirect(301, format!("https://{}{}", host, target)));
        }
        if scheme == "http" && config.viewer_protocol_policy == ViewerProtocolPolicy::HttpsOnly {
            return Ok(SimulatedResponse::status(403));
        }

        let rule = state
            .functions
            .values()
            .find(|f| f.arn == config.viewer_request_function)
            .map(|f| f.rule.clone())
            .unwrap_or_else(RewriteRule::default);

        let uri = match rule.evaluate(path) {
            RewriteOutcome::Redirect { status, location } => {
                return Ok(SimulatedResponse::redirect(status, location))
            }
            outcome => outcome.forwarded_uri().unwrap_or(path).to_string(),
        };

        let store = state
            .stores
            .values()
            .find(|s| s.store.regional_domain == config.origin.domain_name)
            .map(|s| s.store.name.clone())
            .ok_or_else(|| anyhow!("origin {} does not exist", config.origin.domain_name))?;

        let (status, object) = origin_read(&state, &store, &uri, Some(&distribution.arn))?;
        if let Some(object) = object {
            return Ok(SimulatedResponse {
                status,
                location: None,
                content_type: Some(object.content_type),
                body: object.body,
                cache_key: Some(uri),
            });
        }

        let Some(mapping) = config.custom_errors.iter().find(|e| e.error_code == status) else {
            return Ok(SimulatedResponse {
                cache_key: Some(uri),
                ..SimulatedResponse::status(status)
            });
        };

        let (_, page) = origin_read(&state, &store, &mapping.response_page_path, Some(&distribution.arn))?;
        Ok(SimulatedResponse {
            status: mapping.response_code,
            location: None,
            content_type: page.as_ref().map(|p| p.content_type.clone()),
            body: page.map(|p| p.body).unwrap_or_default(),
            cache_key: Some(uri),
        })
    }
}

/// Missing keys answer 404 to authorized readers and 403 to everyone else
fn origin_read(
    state: &AccountState,
    store: &str,
    key: &str,
    source_arn: Option<&str>,
) -> Result<(u16, Option<StoredObject>)> {
    let entry = state
        .stores
        .get(store)
        .ok_or_else(|| anyhow!("NoSuchBucket: {}", store))?;

    let request = match source_arn {
        Some(arn) => AccessRequest::edge_read(&entry.store.arn, key, arn),
        None => AccessRequest::anonymous_read(&entry.store.arn, key),
    };
    let decision = entry
        .policy
        .as_ref()
        .map(|p| p.evaluate(&request))
        .unwrap_or(Decision::Deny);

    if decision == Decision::Deny {
        return Ok((403, None));
    }

    match entry.objects.get(key.trim_start_matches('/')) {
        Some(object) => Ok((200, Some(object.clone()))),
        None => Ok((404, None)),
    }
}

fn short_id(prefix: &str) -> String {
    let raw = Uuid::new_v4().simple().to_string().to_ascii_uppercase();
    format!("{}{}", prefix, &raw[..13])
}

fn challenge_for(certificate_id: &str, domain: &str) -> ChallengeRecord {
    let token = hex::encode(Sha256::digest(format!("{}:{}:name", certificate_id, domain).as_bytes()));
    let value = hex::encode(Sha256::digest(format!("{}:{}:value", certificate_id, domain).as_bytes()));

    ChallengeRecord {
        domain: domain.to_string(),
        name: format!("_{}.{}", &token[..32], domain),
        record_type: RecordType::CNAME,
        value: format!("_{}.acm-validations.aws", &value[..32]),
    }
}

fn conflicts_with(existing: &RecordSet, incoming: &RecordSet) -> bool {
    existing.name == incoming.name
        && existing.record_type != incoming.record_type
        && (existing.record_type == RecordType::CNAME || incoming.record_type == RecordType::CNAME)
}

fn is_public(policy: &PolicyDocument) -> bool {
    policy
        .statement
        .iter()
        .any(|s| s.effect == Effect::Allow && s.principal.aws.iter().any(|p| p == "*"))
}

// ============================================================
// Provider Implementations
// ============================================================

#[async_trait]
impl ZoneApi for InMemoryCloud {
    async fn list_hosted_zones(&self) -> Result<Vec<HostedZone>> {
        Ok(self.lock().zones.clone())
    }
}

#[async_trait]
impl RecordApi for InMemoryCloud {
    async fn list_record_sets(&self, zone_id: &str, name: &str) -> Result<Vec<RecordSet>> {
        let mut state = self.lock();
        let name = normalize_name(name);
        Ok(state
            .zone_records(zone_id)?
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect())
    }

    async fn upsert_record_set(&self, zone_id: &str, record: &RecordSet) -> Result<()> {
        let mut state = self.lock();
        let mut record = record.clone();
        record.name = normalize_name(&record.name);

        let records = state.zone_records(zone_id)?;
        if let Some(existing) = records.iter().find(|r| conflicts_with(r, &record)) {
            bail!(
                "InvalidChangeBatch: {} {} conflicts with existing {} record",
                record.record_type,
                record.name,
                existing.record_type
            );
        }

        match records
            .iter_mut()
            .find(|r| r.name == record.name && r.record_type == record.record_type)
        {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }

        state.record(JournalKind::RecordUpserted {
            zone_id: zone_id.to_string(),
            name: record.name,
            record_type: record.record_type,
        });
        Ok(())
    }

    async fn delete_record_set(&self, zone_id: &str, name: &str, record_type: RecordType) -> Result<()> {
        let mut state = self.lock();
        let name = normalize_name(name);

        let records = state.zone_records(zone_id)?;
        let before = records.len();
        records.retain(|r| !(r.name == name && r.record_type == record_type));
        if records.len() == before {
            bail!("InvalidChangeBatch: {} {} not found", record_type, name);
        }

        state.record(JournalKind::RecordDeleted {
            zone_id: zone_id.to_string(),
            name,
            record_type,
        });
        Ok(())
    }
}

#[async_trait]
impl CertificateApi for InMemoryCloud {
    async fn list_certificates(&self) -> Result<Vec<CertificateRecord>> {
        let state = self.lock();
        Ok(state
            .certificates
            .values()
            .map(|entry| state.certificate_view(entry))
            .collect())
    }

    async fn request_certificate(
        &self,
        domain: &str,
        alternative_names: &[String],
        _tags: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut state = self.lock();
        let id = format!(
            "arn:aws:acm:{}:{}:certificate/{}",
            state.region,
            state.account_id,
            Uuid::new_v4()
        );

        let mut names = vec![normalize_name(domain)];
        for name in alternative_names.iter().map(|n| normalize_name(n)) {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let record = CertificateRecord {
            id: id.clone(),
            challenges: names.iter().map(|n| challenge_for(&id, n)).collect(),
            domain_names: names.clone(),
            state: CertificateState::Pending,
            not_after: None,
            in_use_by: Vec::new(),
            created_at: Utc::now(),
        };

        state
            .certificates
            .insert(id.clone(), CertificateEntry { record, polls: 0 });
        state.record(JournalKind::CertificateRequested {
            id: id.clone(),
            names,
        });
        Ok(id)
    }

    async fn describe_certificate(&self, id: &str) -> Result<CertificateRecord> {
        let mut state = self.lock();
        state.poll_certificate(id)?;
        let entry = state
            .certificates
            .get(id)
            .ok_or_else(|| anyhow!("ResourceNotFoundException: certificate {}", id))?;
        Ok(state.certificate_view(entry))
    }

    async fn delete_certificate(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.certificates.contains_key(id) {
            bail!("ResourceNotFoundException: certificate {}", id);
        }
        let users = state.certificate_users(id);
        if !users.is_empty() {
            bail!("ResourceInUseException: certificate {} is used by {:?}", id, users);
        }

        state.certificates.remove(id);
        state.record(JournalKind::CertificateDeleted { id: id.to_string() });
        Ok(())
    }
}

#[async_trait]
impl StoreApi for InMemoryCloud {
    async fn get_store(&self, name: &str) -> Result<Option<OriginStore>> {
        Ok(self.lock().stores.get(name).map(|e| e.store.clone()))
    }

    async fn create_store(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<OriginStore> {
        let mut state = self.lock();
        if state.stores.contains_key(name) {
            bail!("BucketAlreadyOwnedByYou: {}", name);
        }

        // New stores start private and owner-enforced, but unversioned
        let store = OriginStore {
            name: name.to_string(),
            arn: format!("arn:aws:s3:::{}", name),
            regional_domain: format!("{}.s3.{}.amazonaws.com", name, state.region),
            public_access_block: PublicAccessBlock::locked(),
            ownership: ObjectOwnership::BucketOwnerEnforced,
            versioning: false,
            tags: tags.clone(),
        };

        state.stores.insert(
            name.to_string(),
            StoreEntry {
                store: store.clone(),
                policy: None,
                objects: BTreeMap::new(),
            },
        );
        state.record(JournalKind::StoreCreated {
            name: name.to_string(),
        });
        Ok(store)
    }

    async fn put_public_access_block(&self, name: &str, block: &PublicAccessBlock) -> Result<()> {
        let mut state = self.lock();
        state.store_entry(name)?.store.public_access_block = *block;
        state.record(JournalKind::StoreConfigured {
            name: name.to_string(),
            setting: "public_access_block".to_string(),
        });
        Ok(())
    }

    async fn put_ownership(&self, name: &str, ownership: ObjectOwnership) -> Result<()> {
        let mut state = self.lock();
        state.store_entry(name)?.store.ownership = ownership;
        state.record(JournalKind::StoreConfigured {
            name: name.to_string(),
            setting: "ownership".to_string(),
        });
        Ok(())
    }

    async fn put_versioning(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.lock();
        state.store_entry(name)?.store.versioning = enabled;
        state.record(JournalKind::StoreConfigured {
            name: name.to_string(),
            setting: "versioning".to_string(),
        });
        Ok(())
    }

    async fn put_tags(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.lock();
        state.store_entry(name)?.store.tags = tags.clone();
        state.record(JournalKind::StoreConfigured {
            name: name.to_string(),
            setting: "tags".to_string(),
        });
        Ok(())
    }

    async fn get_policy(&self, name: &str) -> Result<Option<PolicyDocument>> {
        let mut state = self.lock();
        Ok(state.store_entry(name)?.policy.clone())
    }

    async fn put_policy(&self, name: &str, policy: &PolicyDocument) -> Result<()> {
        let mut state = self.lock();
        let entry = state.store_entry(name)?;
        if entry.store.public_access_block.block_public_policy && is_public(policy) {
            bail!("AccessDenied: public policies are blocked on {}", name);
        }
        entry.policy = Some(policy.clone());
        state.record(JournalKind::PolicyPut {
            store: name.to_string(),
        });
        Ok(())
    }

    async fn list_objects(&self, name: &str) -> Result<Vec<ObjectSummary>> {
        let mut state = self.lock();
        Ok(state
            .store_entry(name)?
            .objects
            .values()
            .map(|o| ObjectSummary {
                key: o.key.clone(),
                size: o.body.len() as u64,
                checksum_sha256: Some(o.checksum_sha256.clone()),
            })
            .collect())
    }

    async fn put_object(&self, name: &str, object: StoredObject) -> Result<()> {
        let actual = base64::engine::general_purpose::STANDARD.encode(Sha256::digest(&object.body).as_slice());
        if actual != object.checksum_sha256 {
            bail!("BadDigest: checksum mismatch for {}", object.key);
        }

        let mut state = self.lock();
        let key = object.key.clone();
        state.store_entry(name)?.objects.insert(key.clone(), object);
        state.record(JournalKind::ObjectPut {
            store: name.to_string(),
            key,
        });
        Ok(())
    }

    async fn delete_object(&self, name: &str, key: &str) -> Result<()> {
        let mut state = self.lock();
        state.store_entry(name)?.objects.remove(key);
        state.record(JournalKind::ObjectDeleted {
            store: name.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl EdgeApi for InMemoryCloud {
    async fn find_access_identity(&self, name: &str) -> Result<Option<AccessIdentity>> {
        Ok(self.lock().identities.iter().find(|i| i.name == name).cloned())
    }

    async fn create_access_identity(&self, name: &str, description: &str) -> Result<AccessIdentity> {
        let mut state = self.lock();
        if state.identities.iter().any(|i| i.name == name) {
            bail!("OriginAccessControlAlreadyExists: {}", name);
        }

        let identity = AccessIdentity {
            id: short_id("E"),
            name: name.to_string(),
            description: description.to_string(),
            signing_protocol: "sigv4".to_string(),
            signing_behavior: "always".to_string(),
        };
        state.identities.push(identity.clone());
        state.record(JournalKind::IdentityCreated {
            id: identity.id.clone(),
            name: name.to_string(),
        });
        Ok(identity)
    }

    async fn get_function(&self, name: &str) -> Result<Option<EdgeFunction>> {
        Ok(self.lock().functions.get(name).cloned())
    }

    async fn publish_function(&self, name: &str, rule: &RewriteRule) -> Result<EdgeFunction> {
        let mut state = self.lock();
        let function = EdgeFunction {
            name: name.to_string(),
            arn: format!("arn:aws:cloudfront::{}:function/{}", state.account_id, name),
            rule: rule.clone(),
            code: rule.render_function(),
        };
        state.functions.insert(name.to_string(), function.clone());
        state.record(JournalKind::FunctionPublished {
            name: name.to_string(),
        });
        Ok(function)
    }

    async fn find_distribution(&self, caller_reference: &str) -> Result<Option<EdgeDistribution>> {
        Ok(self
            .lock()
            .distributions
            .values()
            .find(|d| d.config.caller_reference == caller_reference)
            .cloned())
    }

    async fn create_distribution(&self, config: &DistributionConfig) -> Result<EdgeDistribution> {
        let mut state = self.lock();
        state.check_distribution(config, None)?;

        let id = short_id("E");
        let distribution = EdgeDistribution {
            arn: format!("arn:aws:cloudfront::{}:distribution/{}", state.account_id, id),
            domain_name: format!("d{}.cloudfront.net", &short_id("")[..13].to_ascii_lowercase()),
            status: DistributionStatus::Deployed,
            config: config.clone(),
            id: id.clone(),
        };

        state.distributions.insert(id.clone(), distribution.clone());
        state.record(JournalKind::DistributionCreated {
            id,
            certificate_id: config.certificate_id.clone(),
        });
        Ok(distribution)
    }

    async fn update_distribution(&self, id: &str, config: &DistributionConfig) -> Result<EdgeDistribution> {
        let mut state = self.lock();
        let current = state
            .distributions
            .get(id)
            .ok_or_else(|| anyhow!("NoSuchDistribution: {}", id))?;
        if current.config.caller_reference != config.caller_reference {
            bail!("IllegalUpdate: caller reference of {} cannot change", id);
        }
        state.check_distribution(config, Some(id))?;

        let distribution = match state.distributions.get_mut(id) {
            Some(distribution) => {
                distribution.config = config.clone();
                distribution.status = DistributionStatus::Deployed;
                distribution.clone()
            }
            None => bail!("NoSuchDistribution: {}", id),
        };

        state.record(JournalKind::DistributionUpdated {
            id: id.to_string(),
            certificate_id: config.certificate_id.clone(),
        });
        Ok(distribution)
    }

    async fn create_invalidation(&self, distribution_id: &str, paths: &[String]) -> Result<String> {
        let mut state = self.lock();
        if !state.distributions.contains_key(distribution_id) {
            bail!("NoSuchDistribution: {}", distribution_id);
        }

        let id = short_id("I");
        state.invalidations.push(Invalidation {
            id: id.clone(),
            distribution_id: distribution_id.to_string(),
            paths: paths.to_vec(),
            created_at: Utc::now(),
        });
        state.record(JournalKind::InvalidationCreated {
            id: id.clone(),
            distribution_id: distribution_id.to_string(),
            paths: paths.to_vec(),
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::edge::policy::{Principal, Statement};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_certificate_validates_only_after_challenges_published() {
        let cloud = InMemoryCloud::new();
        let zone = cloud.add_hosted_zone("example.test", false);
        let id = cloud
            .request_certificate("example.test", &[], &BTreeMap::new())
            .await
            .unwrap();

        let pending = cloud.describe_certificate(&id).await.unwrap();
        assert_eq!(pending.state, CertificateState::Pending);

        let challenge = &pending.challenges[0];
        cloud
            .upsert_record_set(
                &zone.id,
                &RecordSet::simple(&challenge.name, challenge.record_type, 60, &challenge.value),
            )
            .await
            .unwrap();

        let validated = cloud.describe_certificate(&id).await.unwrap();
        assert_eq!(validated.state, CertificateState::Validated);
        assert!(validated.not_after.is_some());
    }

    #[tokio::test]
    async fn test_cname_cannot_share_a_name() {
        let cloud = InMemoryCloud::new();
        let zone = cloud.add_hosted_zone("example.test", false);
        cloud
            .upsert_record_set(
                &zone.id,
                &RecordSet::simple("www.example.test", RecordType::A, 300, "192.0.2.1"),
            )
            .await
            .unwrap();

        let err = cloud
            .upsert_record_set(
                &zone.id,
                &RecordSet::simple("www.example.test", RecordType::CNAME, 300, "x.test"),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("InvalidChangeBatch"));
    }

    #[tokio::test]
    async fn test_public_policy_blocked() {
        let cloud = InMemoryCloud::new();
        let store = cloud.create_store("example.test", &BTreeMap::new()).await.unwrap();

        let policy = PolicyDocument {
            version: "2012-10-17".to_string(),
            statement: vec![Statement {
                sid: None,
                effect: Effect::Allow,
                principal: Principal {
                    service: Vec::new(),
                    aws: vec!["*".to_string()],
                },
                action: vec!["s3:GetObject".to_string()],
                resource: vec![format!("{}/*", store.arn)],
                condition: BTreeMap::new(),
            }],
        };

        assert!(cloud.put_policy("example.test", &policy).await.is_err());
        assert_eq!(cloud.origin_read("example.test", "index.html", None).unwrap().0, 403);
    }

    #[tokio::test]
    async fn test_put_object_verifies_checksum() {
        let cloud = InMemoryCloud::new();
        cloud.create_store("example.test", &BTreeMap::new()).await.unwrap();

        let err = cloud
            .put_object(
                "example.test",
                StoredObject {
                    key: "index.html".to_string(),
                    content_type: "text/html".to_string(),
                    checksum_sha256: "bogus".to_string(),
                    body: b"hello".to_vec(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("BadDigest"));
    }

    #[tokio::test]
    async fn test_state_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("account.json");

        let cloud = InMemoryCloud::load(&path).unwrap();
        cloud.add_hosted_zone("example.test", false);
        cloud.create_store("example.test", &BTreeMap::new()).await.unwrap();
        cloud.save(&path).unwrap();

        let reloaded = InMemoryCloud::load(&path).unwrap();
        assert_eq!(reloaded.list_hosted_zones().await.unwrap().len(), 1);
        assert!(reloaded.get_store("example.test").await.unwrap().is_some());
        assert_eq!(reloaded.journal().len(), 2);
    }
}
