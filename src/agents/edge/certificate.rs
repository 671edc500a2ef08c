//! Certificate Lifecycle Manager
//!
//! Keeps one validated certificate covering exactly the apex and its aliases.
//! A replacement is requested when none exists or the current one enters the
//! renewal window. Older certificates are only retired once nothing
//! references them any more, so the site is never left without a valid
//! binding.

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::error::{ComponentContext, ConvergeError};
use super::providers::{CertificateApi, RecordApi};
use super::types::{
    normalize_name, Action, CertificateRecord, CertificateState, Change, ChallengeRecord,
    Component, HostedZone, RecordSet, ValidationSettings,
};

/// Result of [`CertificateManager::ensure_certificate`]
#[derive(Debug, Clone)]
pub struct CertificateOutcome {
    pub certificate: CertificateRecord,
    pub action: Action,
}

pub struct CertificateManager {
    certificates: Arc<dyn CertificateApi>,
    records: Arc<dyn RecordApi>,
    settings: ValidationSettings,
}

impl CertificateManager {
    pub fn new(
        certificates: Arc<dyn CertificateApi>,
        records: Arc<dyn RecordApi>,
        settings: ValidationSettings,
    ) -> Self {
        Self {
            certificates,
            records,
            settings,
        }
    }

    /// Return a validated certificate covering `domain` and `aliases`,
    /// requesting and validating a new one when needed.
    pub async fn ensure_certificate(
        &self,
        zone: &HostedZone,
        domain: &str,
        aliases: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<CertificateOutcome, ConvergeError> {
        let desired = desired_names(domain, aliases);
        let existing = self
            .certificates
            .list_certificates()
            .await
            .within(Component::Certificate)?;

        let now = Utc::now();
        let reusable = existing
            .iter()
            .filter(|c| c.is_validated() && c.covers_exactly(&desired))
            .filter(|c| !needs_renewal(c, now, self.settings.renew_before_days))
            .max_by_key(|c| c.created_at);

        if let Some(certificate) = reusable {
            debug!(certificate = %certificate.id, "Reusing validated certificate");
            return Ok(CertificateOutcome {
                certificate: certificate.clone(),
                action: Action::Unchanged,
            });
        }

        // An interrupted run may have left a request for the same names behind
        let pending = existing
            .iter()
            .filter(|c| c.state == CertificateState::Pending && c.covers_exactly(&desired))
            .max_by_key(|c| c.created_at);

        let certificate_id = match pending {
            Some(certificate) => {
                info!(certificate = %certificate.id, "Resuming pending certificate request");
                certificate.id.clone()
            }
            None => {
                let primary = normalize_name(domain);
                let alternative_names: Vec<String> =
                    desired.iter().filter(|n| **n != primary).cloned().collect();
                let id = self
                    .certificates
                    .request_certificate(&primary, &alternative_names, tags)
                    .await
                    .within(Component::Certificate)?;
                info!(certificate = %id, names = ?desired, "Requested certificate");
                id
            }
        };

        let certificate = self.validate(zone, &certificate_id).await?;

        info!(certificate = %certificate.id, "Certificate validated");
        Ok(CertificateOutcome {
            certificate,
            action: Action::Created,
        })
    }

    /// Upsert every distinct challenge record into the zone concurrently
    pub async fn publish_challenges(
        &self,
        zone: &HostedZone,
        challenges: &[ChallengeRecord],
    ) -> Result<(), ConvergeError> {
        let ttl = self.settings.challenge_ttl;
        let upserts: BTreeMap<(String, String), RecordSet> = challenges
            .iter()
            .map(|c| {
                (
                    (normalize_name(&c.name), c.value.clone()),
                    RecordSet::simple(&c.name, c.record_type, ttl, &c.value),
                )
            })
            .collect();

        try_join_all(
            upserts
                .values()
                .map(|record| self.records.upsert_record_set(&zone.id, record)),
        )
        .await
        .within(Component::Certificate)?;

        debug!(zone = %zone.id, count = upserts.len(), "Published validation records");
        Ok(())
    }

    /// Wait for the challenges, publish them and wait for validation, all
    /// under one deadline
    async fn validate(&self, zone: &HostedZone, id: &str) -> Result<CertificateRecord, ConvergeError> {
        let limit = Duration::from_secs(self.settings.timeout_secs);
        let phases = async {
            let challenges = self.poll_challenges(id).await?;
            self.publish_challenges(zone, &challenges).await?;
            self.poll_validation(id).await
        };

        match timeout(limit, phases).await {
            Ok(result) => result,
            Err(_) => Err(ConvergeError::CertificateValidationFailed {
                certificate_id: id.to_string(),
                reason: format!("not validated within {}s", self.settings.timeout_secs),
            }),
        }
    }

    async fn poll_challenges(&self, id: &str) -> Result<Vec<ChallengeRecord>, ConvergeError> {
        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        loop {
            let certificate = self
                .certificates
                .describe_certificate(id)
                .await
                .within(Component::Certificate)?;
            if !certificate.challenges.is_empty() {
                return Ok(certificate.challenges);
            }
            debug!(certificate = %id, "Waiting for validation challenges");
            sleep(poll).await;
        }
    }

    async fn poll_validation(&self, id: &str) -> Result<CertificateRecord, ConvergeError> {
        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        loop {
            let certificate = self
                .certificates
                .describe_certificate(id)
                .await
                .within(Component::Certificate)?;

            match certificate.state {
                CertificateState::Validated => return Ok(certificate),
                CertificateState::Failed => {
                    return Err(ConvergeError::CertificateValidationFailed {
                        certificate_id: id.to_string(),
                        reason: "rejected by the certificate authority".to_string(),
                    })
                }
                CertificateState::Pending => {
                    debug!(certificate = %id, "Certificate still pending validation");
                    sleep(poll).await;
                }
            }
        }
    }

    /// Delete certificates for the same site that `current` replaced.
    /// Certificates still referenced by a distribution are left in place.
    pub async fn retire_superseded(
        &self,
        current: &CertificateRecord,
    ) -> Result<Vec<Change>, ConvergeError> {
        if !current.is_validated() {
            return Ok(Vec::new());
        }

        let Some(primary) = current.domain_names.first().map(|n| normalize_name(n)) else {
            return Ok(Vec::new());
        };

        let existing = self
            .certificates
            .list_certificates()
            .await
            .within(Component::Certificate)?;

        let mut changes = Vec::new();
        for certificate in existing.iter().filter(|c| is_superseded_by(c, current, &primary)) {
            if !certificate.in_use_by.is_empty() {
                warn!(
                    certificate = %certificate.id,
                    in_use_by = ?certificate.in_use_by,
                    "Superseded certificate still referenced, keeping it"
                );
                continue;
            }

            self.certificates
                .delete_certificate(&certificate.id)
                .await
                .within(Component::Certificate)?;
            info!(certificate = %certificate.id, replaced_by = %current.id, "Retired superseded certificate");
            changes.push(Change::new(format!("certificate {}", certificate.id), Action::Deleted));
        }

        Ok(changes)
    }
}

/// `{domain} ∪ aliases`, normalized
pub fn desired_names(domain: &str, aliases: &[String]) -> BTreeSet<String> {
    std::iter::once(domain)
        .chain(aliases.iter().map(String::as_str))
        .map(normalize_name)
        .collect()
}

/// Inside the renewal window (or already expired)
pub fn needs_renewal(
    certificate: &CertificateRecord,
    now: chrono::DateTime<Utc>,
    renew_before_days: i64,
) -> bool {
    certificate
        .not_after
        .map(|not_after| not_after - now <= ChronoDuration::days(renew_before_days))
        .unwrap_or(false)
}

fn is_superseded_by(candidate: &CertificateRecord, current: &CertificateRecord, primary: &str) -> bool {
    candidate.id != current.id
        && candidate.state != CertificateState::Pending
        && candidate.created_at <= current.created_at
        && candidate
            .domain_names
            .first()
            .map(|n| normalize_name(n) == primary)
            .unwrap_or(false)
}
