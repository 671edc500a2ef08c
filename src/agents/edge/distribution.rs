//! Edge Distribution Manager
//!
//! Owns the access identity, the viewer-request rewrite function and the
//! distribution itself. The distribution is found again by its caller
//! reference (the apex domain) and is only ever updated in place.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::certificate::desired_names;
use super::error::{ComponentContext, ConvergeError};
use super::providers::EdgeApi;
use super::rewrite::RewriteRule;
use super::types::{
    AccessIdentity, Action, CertificateRecord, Change, Component, CustomErrorResponse,
    DistributionConfig, EdgeDistribution, EdgeFunction, EngineConfig, OriginBinding,
    OriginStore, ViewerProtocolPolicy,
};

/// Result of [`EdgeDistributionManager::ensure_distribution`]
#[derive(Debug, Clone)]
pub struct DistributionOutcome {
    pub distribution: EdgeDistribution,
    pub identity: AccessIdentity,
    pub function: EdgeFunction,
    pub changes: Vec<Change>,
}

pub struct EdgeDistributionManager {
    api: Arc<dyn EdgeApi>,
    config: EngineConfig,
}

impl EdgeDistributionManager {
    pub fn new(api: Arc<dyn EdgeApi>, config: EngineConfig) -> Self {
        Self { api, config }
    }

    /// Converge the distribution for `domain` serving `origin` under
    /// `aliases` (apex included) with `certificate`.
    pub async fn ensure_distribution(
        &self,
        domain: &str,
        origin: &OriginStore,
        certificate: &CertificateRecord,
        aliases: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<DistributionOutcome, ConvergeError> {
        if !certificate.is_validated() {
            return Err(ConvergeError::CertificateValidationFailed {
                certificate_id: certificate.id.clone(),
                reason: format!("certificate is {}, refusing to bind it", certificate.state),
            });
        }
        if !certificate.covers_exactly(&desired_names(domain, aliases)) {
            return Err(ConvergeError::provisioning(
                Component::Distribution,
                anyhow::anyhow!(
                    "certificate {} does not cover exactly {:?}",
                    certificate.id,
                    aliases
                ),
            ));
        }

        let mut changes = Vec::new();

        let (identity, action) = self.ensure_identity(origin).await?;
        changes.push(Change::new(format!("access-identity {}", identity.name), action));

        let (function, action) = self
            .ensure_function(&function_name(domain), &self.config.rewrite)
            .await?;
        changes.push(Change::new(format!("function {}", function.name), action));

        let desired = self.desired_config(domain, origin, &identity, certificate, &function, aliases, tags);

        let existing = self
            .api
            .find_distribution(&desired.caller_reference)
            .await
            .within(Component::Distribution)?;

        let (distribution, action) = match existing {
            None => {
                let distribution = self
                    .api
                    .create_distribution(&desired)
                    .await
                    .within(Component::Distribution)?;
                info!(
                    distribution = %distribution.id,
                    endpoint = %distribution.domain_name,
                    "Created edge distribution"
                );
                (distribution, Action::Created)
            }
            Some(current) if current.config == desired => {
                debug!(distribution = %current.id, "Edge distribution unchanged");
                (current, Action::Unchanged)
            }
            Some(current) => {
                let fields = config_changes(&current.config, &desired);
                let distribution = self
                    .api
                    .update_distribution(&current.id, &desired)
                    .await
                    .within(Component::Distribution)?;
                info!(
                    distribution = %distribution.id,
                    fields = ?fields,
                    "Updated edge distribution in place"
                );
                (distribution, Action::Updated)
            }
        };
        changes.push(Change::new(format!("distribution {}", distribution.id), action));

        Ok(DistributionOutcome {
            distribution,
            identity,
            function,
            changes,
        })
    }

    async fn ensure_identity(
        &self,
        origin: &OriginStore,
    ) -> Result<(AccessIdentity, Action), ConvergeError> {
        let name = identity_name(&origin.name);
        if let Some(identity) = self
            .api
            .find_access_identity(&name)
            .await
            .within(Component::Distribution)?
        {
            return Ok((identity, Action::Unchanged));
        }

        let identity = self
            .api
            .create_access_identity(&name, &format!("Edge read access to {}", origin.name))
            .await
            .within(Component::Distribution)?;
        info!(identity = %identity.id, name = %name, "Registered access identity");
        Ok((identity, Action::Created))
    }

    async fn ensure_function(
        &self,
        name: &str,
        rule: &RewriteRule,
    ) -> Result<(EdgeFunction, Action), ConvergeError> {
        let action = match self
            .api
            .get_function(name)
            .await
            .within(Component::Distribution)?
        {
            Some(function) if &function.rule == rule => return Ok((function, Action::Unchanged)),
            Some(_) => Action::Updated,
            None => Action::Created,
        };

        let function = self
            .api
            .publish_function(name, rule)
            .await
            .within(Component::Distribution)?;
        info!(function = %function.name, action = ?action, "Published rewrite function");
        Ok((function, action))
    }

    #[allow(clippy::too_many_arguments)]
    fn desired_config(
        &self,
        domain: &str,
        origin: &OriginStore,
        identity: &AccessIdentity,
        certificate: &CertificateRecord,
        function: &EdgeFunction,
        aliases: &[String],
        tags: &BTreeMap<String, String>,
    ) -> DistributionConfig {
        let mut aliases = aliases.to_vec();
        aliases.sort();
        aliases.dedup();

        let methods = || vec!["GET".to_string(), "HEAD".to_string(), "OPTIONS".to_string()];
        let error_page = &self.config.error_page;

        DistributionConfig {
            caller_reference: domain.to_string(),
            comment: format!("Static site {}", domain),
            enabled: true,
            aliases,
            origin: OriginBinding {
                origin_id: format!("store-{}", origin.name),
                domain_name: origin.regional_domain.clone(),
                access_identity_id: identity.id.clone(),
            },
            certificate_id: certificate.id.clone(),
            minimum_protocol_version: self.config.minimum_protocol_version.clone(),
            ssl_support_method: "sni-only".to_string(),
            viewer_protocol_policy: ViewerProtocolPolicy::RedirectToHttps,
            allowed_methods: methods(),
            cached_methods: methods(),
            compress: true,
            forward_query_string: false,
            forward_cookies: false,
            ttl: self.config.ttl,
            viewer_request_function: function.arn.clone(),
            custom_errors: vec![CustomErrorResponse {
                error_code: 404,
                response_page_path: error_page.path.clone(),
                response_code: error_page.response_code,
                error_caching_min_ttl: self.config.ttl.min,
            }],
            default_root_object: self.config.rewrite.index_document.clone(),
            ipv6_enabled: true,
            http_version: "http2and3".to_string(),
            price_class: self.config.price_class.clone(),
            tags: tags.clone(),
        }
    }
}

/// `example.test` -> `example-test-rewrite`
pub fn function_name(domain: &str) -> String {
    format!("{}-rewrite", domain.replace('.', "-"))
}

pub fn identity_name(store: &str) -> String {
    format!("{}-oac", store)
}

/// Names of the top-level fields that differ between two configs
pub fn config_changes(current: &DistributionConfig, desired: &DistributionConfig) -> Vec<&'static str> {
    let mut fields = Vec::new();
    let mut check = |name: &'static str, differs: bool| {
        if differs {
            fields.push(name);
        }
    };

    check("comment", current.comment != desired.comment);
    check("enabled", current.enabled != desired.enabled);
    check("aliases", current.aliases != desired.aliases);
    check("origin", current.origin != desired.origin);
    check("certificate", current.certificate_id != desired.certificate_id);
    check(
        "minimum_protocol_version",
        current.minimum_protocol_version != desired.minimum_protocol_version,
    );
    check("ssl_support_method", current.ssl_support_method != desired.ssl_support_method);
    check(
        "viewer_protocol_policy",
        current.viewer_protocol_policy != desired.viewer_protocol_policy,
    );
    check(
        "methods",
        current.allowed_methods != desired.allowed_methods
            || current.cached_methods != desired.cached_methods,
    );
    check(
        "forwarding",
        current.compress != desired.compress
            || current.forward_query_string != desired.forward_query_string
            || current.forward_cookies != desired.forward_cookies,
    );
    check("ttl", current.ttl != desired.ttl);
    check(
        "viewer_request_function",
        current.viewer_request_function != desired.viewer_request_function,
    );
    check("custom_errors", current.custom_errors != desired.custom_errors);
    check("default_root_object", current.default_root_object != desired.default_root_object);
    check(
        "protocol",
        current.ipv6_enabled != desired.ipv6_enabled || current.http_version != desired.http_version,
    );
    check("price_class", current.price_class != desired.price_class);
    check("tags", current.tags != desired.tags);

    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::edge::certificate::CertificateManager;
    use crate::agents::edge::memory::InMemoryCloud;
    use crate::agents::edge::store::OriginStoreBinder;
    use crate::agents::edge::types::{DistributionStatus, TtlBounds};

    struct Fixture {
        cloud: Arc<InMemoryCloud>,
        store: OriginStore,
        manager: EdgeDistributionManager,
        certificates: CertificateManager,
        zone: crate::agents::edge::types::HostedZone,
    }

    async fn fixture(config: EngineConfig) -> Fixture {
        let cloud = Arc::new(InMemoryCloud::new());
        let zone = cloud.add_hosted_zone("example.test", false);
        let store = OriginStoreBinder::new(cloud.clone())
            .ensure_store("example.test", &BTreeMap::new())
            .await
            .unwrap()
            .store;
        Fixture {
            manager: EdgeDistributionManager::new(cloud.clone(), config.clone()),
            certificates: CertificateManager::new(cloud.clone(), cloud.clone(), config.validation),
            cloud,
            store,
            zone,
        }
    }

    async fn certificate(f: &Fixture, aliases: &[String]) -> CertificateRecord {
        f.certificates
            .ensure_certificate(&f.zone, "example.test", aliases, &BTreeMap::new())
            .await
            .unwrap()
            .certificate
    }

    fn hostnames(www: bool) -> Vec<String> {
        let mut names = vec!["example.test".to_string()];
        if www {
            names.push("www.example.test".to_string());
        }
        names
    }

    #[test]
    fn test_names() {
        assert_eq!(function_name("example.test"), "example-test-rewrite");
        assert_eq!(identity_name("example.test"), "example.test-oac");
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_then_unchanged() {
        let f = fixture(EngineConfig::default()).await;
        let cert = certificate(&f, &hostnames(true)[1..]).await;

        let first = f
            .manager
            .ensure_distribution("example.test", &f.store, &cert, &hostnames(true), &BTreeMap::new())
            .await
            .unwrap();
        assert!(first.changes.iter().all(|c| c.action == Action::Created));

        let config = &first.distribution.config;
        assert_eq!(config.aliases, hostnames(true));
        assert_eq!(config.viewer_protocol_policy, ViewerProtocolPolicy::RedirectToHttps);
        assert_eq!(config.minimum_protocol_version, "TLSv1.2_2021");
        assert_eq!(config.ttl, TtlBounds { min: 0, default: 3600, max: 86400 });
        assert!(!config.forward_query_string && !config.forward_cookies);
        assert_eq!(config.custom_errors[0].response_code, 404);
        assert_eq!(config.origin.access_identity_id, first.identity.id);
        assert_eq!(config.viewer_request_function, first.function.arn);

        let second = f
            .manager
            .ensure_distribution("example.test", &f.store, &cert, &hostnames(true), &BTreeMap::new())
            .await
            .unwrap();
        assert!(second.changes.iter().all(|c| c.action == Action::Unchanged));
        assert_eq!(second.distribution.id, first.distribution.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_certificate_swap_updates_in_place() {
        let f = fixture(EngineConfig::default()).await;
        let apex_only = certificate(&f, &[]).await;
        let first = f
            .manager
            .ensure_distribution("example.test", &f.store, &apex_only, &hostnames(false), &BTreeMap::new())
            .await
            .unwrap();

        let with_www = certificate(&f, &hostnames(true)[1..]).await;
        let second = f
            .manager
            .ensure_distribution("example.test", &f.store, &with_www, &hostnames(true), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(second.distribution.id, first.distribution.id);
        assert_eq!(second.distribution.config.certificate_id, with_www.id);
        assert_eq!(second.distribution.status, DistributionStatus::Deployed);
        assert_eq!(
            second.changes.last().map(|c| c.action),
            Some(Action::Updated)
        );
        assert_eq!(
            config_changes(&first.distribution.config, &second.distribution.config),
            vec!["aliases", "certificate"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_rule_change_republishes_function() {
        let f = fixture(EngineConfig::default()).await;
        let cert = certificate(&f, &[]).await;
        f.manager
            .ensure_distribution("example.test", &f.store, &cert, &hostnames(false), &BTreeMap::new())
            .await
            .unwrap();

        let mut config = EngineConfig::default();
        config.rewrite.redirect_status = 308;
        let manager = EdgeDistributionManager::new(f.cloud.clone(), config);
        let outcome = manager
            .ensure_distribution("example.test", &f.store, &cert, &hostnames(false), &BTreeMap::new())
            .await
            .unwrap();

        let function_change = outcome
            .changes
            .iter()
            .find(|c| c.resource.starts_with("function"))
            .unwrap();
        assert_eq!(function_change.action, Action::Updated);
        assert!(outcome.function.code.contains("statusCode: 308"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refuses_unvalidated_certificate() {
        let f = fixture(EngineConfig::default()).await;
        let mut cert = certificate(&f, &[]).await;
        cert.state = crate::agents::edge::types::CertificateState::Pending;

        let err = f
            .manager
            .ensure_distribution("example.test", &f.store, &cert, &hostnames(false), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::CertificateValidationFailed { .. }));
    }
}
