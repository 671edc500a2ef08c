//! Convergence Orchestrator
//!
//! Runs the components in dependency order for one topology:
//! zone -> certificate -> origin store -> distribution -> access policy ->
//! publisher -> aliases. The first failure aborts the rest of the chain;
//! nothing is rolled back and re-running is the recovery path.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::aliases::DnsAliasBinder;
use super::certificate::CertificateManager;
use super::distribution::EdgeDistributionManager;
use super::error::ConvergeError;
use super::policy::AccessPolicyBinder;
use super::providers::CloudBackend;
use super::publish::ArtifactPublisher;
use super::store::OriginStoreBinder;
use super::types::{
    Action, Change, Component, ComponentReport, ComponentStatus, ConvergeReport, DomainTopology,
    EngineConfig,
};
use super::zone::ZoneResolver;

/// Tracks component outcomes while the chain runs
#[derive(Default)]
struct RunTracker {
    components: Vec<ComponentReport>,
    current: Option<Component>,
    outputs: BTreeMap<String, String>,
}

impl RunTracker {
    fn begin(&mut self, component: Component) {
        debug!(component = %component, "Converging component");
        self.current = Some(component);
    }

    fn converged(&mut self, changes: Vec<Change>, detail: Option<String>) {
        if let Some(component) = self.current.take() {
            self.components.push(ComponentReport {
                component,
                status: ComponentStatus::Converged,
                changes,
                detail,
            });
        }
    }

    fn output(&mut self, key: &str, value: impl Into<String>) {
        self.outputs.insert(key.to_string(), value.into());
    }

    /// Mark the running component failed and everything after it skipped
    fn failed(&mut self, err: &ConvergeError) {
        if let Some(component) = self.current.take() {
            self.components.push(ComponentReport {
                component,
                status: ComponentStatus::Failed,
                changes: Vec::new(),
                detail: Some(err.to_string()),
            });
        }

        for component in Component::ORDER {
            if !self.components.iter().any(|c| c.component == component) {
                self.components.push(ComponentReport {
                    component,
                    status: ComponentStatus::Skipped,
                    changes: Vec::new(),
                    detail: None,
                });
            }
        }
    }

    fn component_mut(&mut self, component: Component) -> Option<&mut ComponentReport> {
        self.components.iter_mut().find(|c| c.component == component)
    }
}

/// Converges a domain topology against a cloud account
pub struct ConvergenceEngine<B: CloudBackend + 'static> {
    backend: Arc<B>,
    config: EngineConfig,
}

impl<B: CloudBackend + 'static> ConvergenceEngine<B> {
    pub fn new(backend: Arc<B>, config: EngineConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one convergence pass. Failures are captured in the report.
    pub async fn converge(&self, topology: &DomainTopology) -> ConvergeReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(run_id = %run_id, domain = %topology.domain, www = topology.enable_www, "Starting convergence run");

        let mut run = RunTracker::default();
        let result = match topology.validate() {
            Ok(()) => self.run_chain(topology, &mut run).await,
            Err(e) => Err(e),
        };

        let error = match result {
            Ok(()) => None,
            Err(e) => {
                run.failed(&e);
                error!(
                    run_id = %run_id,
                    kind = e.kind(),
                    retryable = e.retryable(),
                    error = %e,
                    "Convergence run aborted"
                );
                Some(e.to_reported())
            }
        };

        let report = ConvergeReport {
            run_id,
            domain: topology.domain.clone(),
            success: error.is_none(),
            components: run.components,
            error,
            outputs: run.outputs,
            started_at,
            finished_at: Utc::now(),
        };

        let tally = report.tally();
        info!(
            run_id = %run_id,
            success = report.success,
            created = tally.created,
            updated = tally.updated,
            unchanged = tally.unchanged,
            deleted = tally.deleted,
            "Convergence run complete"
        );
        report
    }

    async fn run_chain(&self, topology: &DomainTopology, run: &mut RunTracker) -> Result<(), ConvergeError> {
        let domain = topology.domain.as_str();
        let hostnames = topology.hostnames();

        run.begin(Component::Zone);
        let zone = ZoneResolver::new(self.backend.clone()).resolve(domain).await?;
        run.output("zone_id", zone.id.clone());
        run.converged(vec![Change::new(format!("zone {}", zone.id), Action::Unchanged)], None);

        run.begin(Component::Certificate);
        let certificates = CertificateManager::new(
            self.backend.clone(),
            self.backend.clone(),
            self.config.validation.clone(),
        );
        let certificate = certificates
            .ensure_certificate(&zone, domain, &topology.aliases(), &topology.tags)
            .await?;
        run.output("certificate_id", certificate.certificate.id.clone());
        run.converged(
            vec![Change::new(
                format!("certificate {}", certificate.certificate.id),
                certificate.action,
            )],
            None,
        );

        run.begin(Component::OriginStore);
        let store = OriginStoreBinder::new(self.backend.clone())
            .ensure_store(&topology.store_name(), &topology.tags)
            .await?;
        run.output("store_arn", store.store.arn.clone());
        let detail = (!store.corrected.is_empty()).then(|| format!("corrected {:?}", store.corrected));
        run.converged(
            vec![Change::new(format!("store {}", store.store.name), store.action)],
            detail,
        );

        run.begin(Component::Distribution);
        let distribution = EdgeDistributionManager::new(self.backend.clone(), self.config.clone())
            .ensure_distribution(domain, &store.store, &certificate.certificate, &hostnames, &topology.tags)
            .await?;
        run.output("distribution_id", distribution.distribution.id.clone());
        run.output("distribution_domain", distribution.distribution.domain_name.clone());
        run.converged(distribution.changes.clone(), None);

        run.begin(Component::AccessPolicy);
        let policy = AccessPolicyBinder::new(self.backend.clone())
            .grant_read(&store.store, &distribution.identity, &distribution.distribution)
            .await?;
        run.converged(
            vec![Change::new(format!("policy {}", store.store.name), policy.action)],
            None,
        );

        run.begin(Component::Publisher);
        match &topology.site_dir {
            Some(site_dir) => {
                let published = ArtifactPublisher::new(
                    self.backend.clone(),
                    self.backend.clone(),
                    self.config.invalidation_limit,
                )
                .publish(&store.store.name, &distribution.distribution.id, site_dir)
                .await?;
                if let Some(id) = &published.invalidation_id {
                    run.output("invalidation_id", id.clone());
                }
                run.converged(published.changes, None);
            }
            None => run.converged(Vec::new(), Some("no site directory".to_string())),
        }

        run.begin(Component::Aliases);
        let changes = DnsAliasBinder::new(self.backend.clone(), self.config.owner_record_prefix.clone())
            .ensure_aliases(&zone, topology, &distribution.distribution)
            .await?;
        run.converged(changes, None);

        // The new certificate is bound everywhere now, older ones can go
        match certificates.retire_superseded(&certificate.certificate).await {
            Ok(retired) => {
                if let Some(report) = run.component_mut(Component::Certificate) {
                    report.changes.extend(retired);
                }
            }
            Err(e) => {
                warn!(error = %e, "Certificate retirement deferred to the next run");
                if let Some(report) = run.component_mut(Component::Certificate) {
                    report.detail = Some(format!("retirement deferred: {}", e));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::edge::memory::InMemoryCloud;

    #[tokio::test(start_paused = true)]
    async fn test_invalid_topology_skips_everything() {
        let cloud = Arc::new(InMemoryCloud::new());
        let engine = ConvergenceEngine::new(cloud.clone(), EngineConfig::default());

        let report = engine.converge(&DomainTopology::new("not a domain")).await;

        assert!(!report.success);
        assert_eq!(report.error.as_ref().unwrap().kind, "InvalidTopology");
        assert!(report
            .components
            .iter()
            .all(|c| c.status == ComponentStatus::Skipped));
        assert!(cloud.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_zone_fails_first_component() {
        let cloud = Arc::new(InMemoryCloud::new());
        let engine = ConvergenceEngine::new(cloud, EngineConfig::default());

        let report = engine.converge(&DomainTopology::new("example.test")).await;

        let error = report.error.as_ref().unwrap();
        assert_eq!(error.kind, "ZoneNotFound");
        assert!(!error.retryable);
        assert_eq!(report.components.len(), Component::ORDER.len());
        assert_eq!(report.components[0].status, ComponentStatus::Failed);
        assert!(report.components[1..]
            .iter()
            .all(|c| c.status == ComponentStatus::Skipped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_orders_components_and_outputs() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.add_hosted_zone("example.test", false);
        let engine = ConvergenceEngine::new(cloud, EngineConfig::default());

        let report = engine.converge(&DomainTopology::new("example.test")).await;

        assert!(report.success, "{:?}", report.error);
        let order: Vec<Component> = report.components.iter().map(|c| c.component).collect();
        assert_eq!(order, Component::ORDER.to_vec());
        for key in ["zone_id", "certificate_id", "store_arn", "distribution_id", "distribution_domain"] {
            assert!(report.outputs.contains_key(key), "missing output {}", key);
        }
        assert_eq!(
            report.component(Component::Publisher).unwrap().detail.as_deref(),
            Some("no site directory")
        );
    }
}
