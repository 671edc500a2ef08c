//! Secure Content-Delivery Convergence Agent
//!
//! Converges a declared domain topology into a live static site: a validated
//! certificate, a private origin store, an edge distribution reading it
//! through a scoped access policy, and DNS aliases for the apex and `www`.
//!
//! ## Architecture
//!
//! - **Zone Resolver**: longest-suffix match of the domain to a hosted zone
//! - **Certificate Lifecycle Manager**: DNS-validated certificates with a
//!   two-phase swap (new one bound before the old one is retired)
//! - **Origin Store Binder**: private, owner-enforced, versioned store
//! - **Edge Distribution Manager**: HTTPS-only distribution with a
//!   viewer-request rewrite rule
//! - **Access Policy Binder**: store policy scoped to one distribution
//! - **DNS Alias Binder**: A/AAAA aliases with TXT ownership markers
//!
//! Components talk to the account only through the traits in `providers`;
//! `aws` implements them against a real account (Route 53, ACM, S3,
//! CloudFront); `memory` implements all of them for local runs and tests.

mod aliases;
mod certificate;
mod distribution;
mod error;
mod orchestrator;
mod policy;
mod providers;
mod publish;
mod rewrite;
mod store;
mod types;
mod zone;
pub mod aws;
pub mod memory;
pub mod smoke;

pub use aliases::{desired_aliases, plan_aliases, AliasStep, DnsAliasBinder, OwnerMarker, EDGE_HOSTED_ZONE_ID};
pub use certificate::{CertificateManager, CertificateOutcome};
pub use distribution::{config_changes, DistributionOutcome, EdgeDistributionManager};
pub use error::{ComponentContext, ConvergeError};
pub use orchestrator::ConvergenceEngine;
pub use policy::{
    AccessPolicyBinder, AccessRequest, Decision, Effect, PolicyDocument, PolicyOutcome, Principal,
    Statement, EDGE_SERVICE_PRINCIPAL,
};
pub use providers::{CertificateApi, CloudBackend, EdgeApi, RecordApi, StoreApi, ZoneApi};
pub use publish::{scan_site, ArtifactPublisher, PublishOutcome, PublishPlan};
pub use rewrite::{RewriteOutcome, RewriteRule};
pub use store::{OriginStoreBinder, StoreDrift, StoreOutcome};
pub use types::*;
pub use zone::{select_zone, ZoneResolver};
