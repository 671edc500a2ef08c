//! Edge Topology Types
//!
//! Core types for the desired topology, the observed cloud resources and the
//! per-run convergence report.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::error::ConvergeError;
use super::rewrite::RewriteRule;

/// Subdomain published alongside the apex when `enable_www` is set
pub const WWW_LABEL: &str = "www";

// ============================================================
// Desired State
// ============================================================

/// Desired topology for one site, supplied once per convergence run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainTopology {
    /// Apex domain (e.g. "example.test")
    pub domain: String,
    /// Whether the `www` alias is published and covered by the certificate
    #[serde(default)]
    pub enable_www: bool,
    /// Resource tags applied to every taggable resource
    #[serde(default, deserialize_with = "unique_tags")]
    pub tags: BTreeMap<String, String>,
    /// Origin store name (defaults to the apex domain)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_name: Option<String>,
    /// Built site to publish into the origin store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_dir: Option<PathBuf>,
}

impl DomainTopology {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: normalize_name(&domain.into()),
            enable_www: false,
            tags: BTreeMap::new(),
            store_name: None,
            site_dir: None,
        }
    }

    /// Toggle the `www` alias
    pub fn with_www(mut self, enabled: bool) -> Self {
        self.enable_www = enabled;
        self
    }

    /// Add a resource tag
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Set the site directory published after the edge tier is bound
    pub fn with_site_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.site_dir = Some(dir.into());
        self
    }

    /// Load a topology from a JSON file and validate it
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read topology file {:?}", path))?;
        let mut topology: DomainTopology = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse topology file {:?}", path))?;
        topology.domain = normalize_name(&topology.domain);
        topology.validate()?;
        Ok(topology)
    }

    /// Check the topology invariants before any provider call is made
    pub fn validate(&self) -> Result<(), ConvergeError> {
        if !is_valid_dns_name(&self.domain) {
            return Err(ConvergeError::InvalidTopology(format!(
                "'{}' is not a valid DNS name",
                self.domain
            )));
        }

        if let Some(key) = self.tags.keys().find(|k| k.is_empty() || k.len() > 128) {
            return Err(ConvergeError::InvalidTopology(format!(
                "tag key '{}' must be 1-128 characters",
                key
            )));
        }

        let store = self.store_name();
        if !is_valid_store_name(&store) {
            return Err(ConvergeError::InvalidTopology(format!(
                "'{}' is not a valid origin store name",
                store
            )));
        }

        Ok(())
    }

    /// `www.<domain>`
    pub fn www_name(&self) -> String {
        format!("{}.{}", WWW_LABEL, self.domain)
    }

    /// Alternative names covered by the certificate besides the apex
    pub fn aliases(&self) -> Vec<String> {
        if self.enable_www {
            vec![self.www_name()]
        } else {
            Vec::new()
        }
    }

    /// Every hostname the site answers for, apex first
    pub fn hostnames(&self) -> Vec<String> {
        let mut names = vec![self.domain.clone()];
        names.extend(self.aliases());
        names
    }

    pub fn store_name(&self) -> String {
        self.store_name
            .clone()
            .unwrap_or_else(|| self.domain.clone())
    }
}

/// Topology accepted from remote callers. Carries no local paths; unknown
/// fields (`site_dir`, `store_name`) are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyRequest {
    pub domain: String,
    #[serde(default)]
    pub enable_www: bool,
    #[serde(default, deserialize_with = "unique_tags")]
    pub tags: BTreeMap<String, String>,
}

impl From<TopologyRequest> for DomainTopology {
    fn from(request: TopologyRequest) -> Self {
        let mut topology = DomainTopology::new(request.domain).with_www(request.enable_www);
        topology.tags = request.tags;
        topology
    }
}

/// Lowercase and strip the trailing root dot
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// RFC 1123 hostname check with at least two labels
pub fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    });

    let tld_alpha = labels
        .last()
        .map(|tld| tld.chars().any(|c| c.is_ascii_lowercase()))
        .unwrap_or(false);

    labels_ok && tld_alpha
}

/// Object store naming rules: 3-63 chars, lowercase, digits, dots and hyphens
pub fn is_valid_store_name(name: &str) -> bool {
    (3..=63).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
        && name
            .chars()
            .last()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
        && !name.contains("..")
}

/// Deserialize a tag map, rejecting duplicate keys instead of silently
/// keeping the last one
fn unique_tags<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct TagVisitor;

    impl<'de> Visitor<'de> for TagVisitor {
        type Value = BTreeMap<String, String>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of unique tag keys to string values")
        }

        fn visit_map<M>(self, mut access: M) -> std::result::Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            let mut tags = BTreeMap::new();
            while let Some((key, value)) = access.next_entry::<String, String>()? {
                if tags.contains_key(&key) {
                    return Err(serde::de::Error::custom(format!(
                        "duplicate tag key '{}'",
                        key
                    )));
                }
                tags.insert(key, value);
            }
            Ok(tags)
        }
    }

    deserializer.deserialize_map(TagVisitor)
}

// ============================================================
// DNS
// ============================================================

/// DNS record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    #[allow(clippy::upper_case_acronyms)]
    AAAA,
    #[allow(clippy::upper_case_acronyms)]
    CNAME,
    #[allow(clippy::upper_case_acronyms)]
    TXT,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::AAAA => write!(f, "AAAA"),
            RecordType::CNAME => write!(f, "CNAME"),
            RecordType::TXT => write!(f, "TXT"),
        }
    }
}

/// An authoritative hosted zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedZone {
    pub id: String,
    /// Zone apex, normalized (no trailing dot)
    pub name: String,
    /// Private zones cannot serve public validation or alias records
    #[serde(default)]
    pub private: bool,
}

/// Alias target of an A/AAAA record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasTarget {
    pub dns_name: String,
    pub hosted_zone_id: String,
    pub evaluate_target_health: bool,
}

/// A record set as stored in a zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSet {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<AliasTarget>,
}

impl RecordSet {
    /// A plain record with a TTL and literal values
    pub fn simple(name: &str, record_type: RecordType, ttl: u32, value: &str) -> Self {
        Self {
            name: normalize_name(name),
            record_type,
            ttl: Some(ttl),
            values: vec![value.to_string()],
            alias: None,
        }
    }

    /// An alias record (no TTL, no values)
    pub fn alias(name: &str, record_type: RecordType, target: AliasTarget) -> Self {
        Self {
            name: normalize_name(name),
            record_type,
            ttl: None,
            values: Vec::new(),
            alias: Some(target),
        }
    }
}

/// An alias record pointing a hostname at the edge distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRecord {
    pub hostname: String,
    pub record_type: RecordType,
    pub target: AliasTarget,
}

impl AliasRecord {
    pub fn to_record_set(&self) -> RecordSet {
        RecordSet::alias(&self.hostname, self.record_type, self.target.clone())
    }
}

// ============================================================
// Certificates
// ============================================================

/// Validation state of a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateState {
    Pending,
    Validated,
    Failed,
}

impl fmt::Display for CertificateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateState::Pending => write!(f, "pending"),
            CertificateState::Validated => write!(f, "validated"),
            CertificateState::Failed => write!(f, "failed"),
        }
    }
}

/// DNS challenge the certificate authority expects for one covered name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChallengeRecord {
    /// Covered domain name this challenge proves
    pub domain: String,
    pub name: String,
    pub record_type: RecordType,
    pub value: String,
}

/// A certificate as reported by the certificate authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: String,
    /// Covered names, primary domain first
    pub domain_names: Vec<String>,
    pub state: CertificateState,
    #[serde(default)]
    pub challenges: Vec<ChallengeRecord>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
    /// Distributions currently referencing this certificate
    #[serde(default)]
    pub in_use_by: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl CertificateRecord {
    /// Whether the certificate covers exactly the given name set
    pub fn covers_exactly(&self, names: &BTreeSet<String>) -> bool {
        let covered: BTreeSet<String> = self.domain_names.iter().map(|n| normalize_name(n)).collect();
        &covered == names
    }

    pub fn is_validated(&self) -> bool {
        self.state == CertificateState::Validated
    }
}

// ============================================================
// Origin Store
// ============================================================

/// Public access block settings of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublicAccessBlock {
    pub block_public_acls: bool,
    pub ignore_public_acls: bool,
    pub block_public_policy: bool,
    pub restrict_public_buckets: bool,
}

impl PublicAccessBlock {
    /// Every public path closed
    pub fn locked() -> Self {
        Self {
            block_public_acls: true,
            ignore_public_acls: true,
            block_public_policy: true,
            restrict_public_buckets: true,
        }
    }

    pub fn is_locked(&self) -> bool {
        *self == Self::locked()
    }
}

/// Object ownership mode of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ObjectOwnership {
    BucketOwnerEnforced,
    BucketOwnerPreferred,
    ObjectWriter,
}

/// A private content store read only by the edge tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginStore {
    pub name: String,
    pub arn: String,
    /// Regional endpoint the edge tier fetches from
    pub regional_domain: String,
    pub public_access_block: PublicAccessBlock,
    pub ownership: ObjectOwnership,
    pub versioning: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Listing entry for an object in a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    /// Base64 SHA-256 of the body
    pub checksum_sha256: Option<String>,
}

/// A full object written to a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    pub content_type: String,
    pub checksum_sha256: String,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
}

mod body_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================
// Edge Tier
// ============================================================

/// Trust anchor representing "requests signed by the edge tier".
/// Carries no credentials; the store policy checks the source distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessIdentity {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Always "sigv4"
    pub signing_protocol: String,
    /// Always "always"
    pub signing_behavior: String,
}

/// Viewer-request function published to the edge tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeFunction {
    pub name: String,
    pub arn: String,
    pub rule: RewriteRule,
    /// Rendered function source as deployed
    pub code: String,
}

/// Viewer protocol policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewerProtocolPolicy {
    AllowAll,
    RedirectToHttps,
    HttpsOnly,
}

/// Cache TTL bounds in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlBounds {
    pub min: u64,
    pub default: u64,
    pub max: u64,
}

impl Default for TtlBounds {
    fn default() -> Self {
        Self {
            min: 0,
            default: 3600,
            max: 86400,
        }
    }
}

/// Custom error mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomErrorResponse {
    pub error_code: u16,
    pub response_page_path: String,
    pub response_code: u16,
    pub error_caching_min_ttl: u64,
}

/// Origin binding of a distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginBinding {
    pub origin_id: String,
    pub domain_name: String,
    pub access_identity_id: String,
}

/// Full desired configuration of an edge distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionConfig {
    /// Stable key used to find the distribution again on later runs
    pub caller_reference: String,
    pub comment: String,
    pub enabled: bool,
    /// Sorted alias hostnames
    pub aliases: Vec<String>,
    pub origin: OriginBinding,
    pub certificate_id: String,
    pub minimum_protocol_version: String,
    pub ssl_support_method: String,
    pub viewer_protocol_policy: ViewerProtocolPolicy,
    pub allowed_methods: Vec<String>,
    pub cached_methods: Vec<String>,
    pub compress: bool,
    pub forward_query_string: bool,
    pub forward_cookies: bool,
    pub ttl: TtlBounds,
    /// ARN of the viewer-request function
    pub viewer_request_function: String,
    pub custom_errors: Vec<CustomErrorResponse>,
    pub default_root_object: String,
    pub ipv6_enabled: bool,
    pub http_version: String,
    pub price_class: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Deployment status reported by the edge tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionStatus {
    InProgress,
    Deployed,
}

/// An edge distribution as observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDistribution {
    pub id: String,
    pub arn: String,
    /// Canonical endpoint aliases point at
    pub domain_name: String,
    pub status: DistributionStatus,
    pub config: DistributionConfig,
}

// ============================================================
// Convergence Report
// ============================================================

/// Pipeline components in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    Zone,
    Certificate,
    OriginStore,
    Distribution,
    AccessPolicy,
    Publisher,
    Aliases,
}

impl Component {
    /// Execution order of one convergence run
    pub const ORDER: [Component; 7] = [
        Component::Zone,
        Component::Certificate,
        Component::OriginStore,
        Component::Distribution,
        Component::AccessPolicy,
        Component::Publisher,
        Component::Aliases,
    ];
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Zone => write!(f, "zone"),
            Component::Certificate => write!(f, "certificate"),
            Component::OriginStore => write!(f, "origin-store"),
            Component::Distribution => write!(f, "distribution"),
            Component::AccessPolicy => write!(f, "access-policy"),
            Component::Publisher => write!(f, "publisher"),
            Component::Aliases => write!(f, "aliases"),
        }
    }
}

/// What happened to a resource during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Updated,
    Unchanged,
    Deleted,
}

/// A single resource-level change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub resource: String,
    pub action: Action,
}

impl Change {
    pub fn new(resource: impl Into<String>, action: Action) -> Self {
        Self {
            resource: resource.into(),
            action,
        }
    }
}

/// Terminal state of one component in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Converged,
    Failed,
    Skipped,
}

/// Per-component section of a report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentReport {
    pub component: Component,
    pub status: ComponentStatus,
    pub changes: Vec<Change>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Error summary carried by a failed report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

/// Counts of actions across a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTally {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

/// Result of one convergence run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergeReport {
    pub run_id: Uuid,
    pub domain: String,
    pub success: bool,
    pub components: Vec<ComponentReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportedError>,
    /// Identifiers of the converged resources (zone, certificate, ...)
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ConvergeReport {
    pub fn component(&self, component: Component) -> Option<&ComponentReport> {
        self.components.iter().find(|c| c.component == component)
    }

    pub fn tally(&self) -> ActionTally {
        let mut tally = ActionTally::default();
        for change in self.components.iter().flat_map(|c| c.changes.iter()) {
            match change.action {
                Action::Created => tally.created += 1,
                Action::Updated => tally.updated += 1,
                Action::Unchanged => tally.unchanged += 1,
                Action::Deleted => tally.deleted += 1,
            }
        }
        tally
    }

    /// True when the run converged without writing anything
    pub fn is_noop(&self) -> bool {
        let tally = self.tally();
        self.success && tally.created == 0 && tally.updated == 0 && tally.deleted == 0
    }
}

// ============================================================
// Engine Configuration
// ============================================================

/// Certificate validation timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Upper bound on waiting for the certificate authority
    pub timeout_secs: u64,
    /// Delay between validation polls
    pub poll_interval_ms: u64,
    /// TTL of published challenge records
    pub challenge_ttl: u32,
    /// Replace validated certificates this many days before expiry
    pub renew_before_days: i64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            poll_interval_ms: 10_000,
            challenge_ttl: 60,
            renew_before_days: 30,
        }
    }
}

/// Page served for missing content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPage {
    pub path: String,
    pub response_code: u16,
}

impl Default for ErrorPage {
    fn default() -> Self {
        Self {
            path: "/404.html".to_string(),
            response_code: 404,
        }
    }
}

/// Tunables of the convergence engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ttl: TtlBounds,
    pub minimum_protocol_version: String,
    pub price_class: String,
    pub error_page: ErrorPage,
    pub validation: ValidationSettings,
    pub rewrite: RewriteRule,
    /// Name prefix of the TXT records marking alias ownership
    pub owner_record_prefix: String,
    /// Above this many changed paths a single wildcard invalidation is sent
    pub invalidation_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ttl: TtlBounds::default(),
            minimum_protocol_version: "TLSv1.2_2021".to_string(),
            price_class: "PriceClass_100".to_string(),
            error_page: ErrorPage::default(),
            validation: ValidationSettings::default(),
            rewrite: RewriteRule::default(),
            owner_record_prefix: "_edge-owner".to_string(),
            invalidation_limit: 15,
        }
    }
}

impl EngineConfig {
    /// Load overrides from a JSON file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse engine config {:?}", path))
    }
}
