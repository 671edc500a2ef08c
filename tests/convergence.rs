//! End-to-end convergence runs against the in-memory account

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use edge_engine::edge::memory::{InMemoryCloud, JournalKind};
use edge_engine::edge::{
    Action, CertificateState, Component, ComponentStatus, ConvergeReport, ConvergenceEngine,
    DomainTopology, Effect, EngineConfig, PolicyDocument, Principal, RecordApi, RecordSet,
    RecordType, Statement, StoreApi,
};
use tempfile::TempDir;

const DOMAIN: &str = "example.test";

fn write_site(root: &Path) {
    fs::create_dir_all(root.join("projects")).unwrap();
    fs::write(root.join("index.html"), "<h1>home</h1>").unwrap();
    fs::write(root.join("404.html"), "<h1>not found</h1>").unwrap();
    fs::write(root.join("projects/index.html"), "<h1>projects</h1>").unwrap();
}

fn setup() -> (Arc<InMemoryCloud>, ConvergenceEngine<InMemoryCloud>) {
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_hosted_zone(DOMAIN, false);
    let engine = ConvergenceEngine::new(cloud.clone(), EngineConfig::default());
    (cloud, engine)
}

fn assert_success(report: &ConvergeReport) {
    assert!(report.success, "run failed: {:?}", report.error);
}

fn alias_names(cloud: &InMemoryCloud) -> BTreeSet<(String, RecordType)> {
    cloud
        .snapshot()
        .records
        .values()
        .flatten()
        .filter(|r| r.alias.is_some())
        .map(|r| (r.name.clone(), r.record_type))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_fresh_site_with_www() {
    let (cloud, engine) = setup();
    let site = TempDir::new().unwrap();
    write_site(site.path());
    let topology = DomainTopology::new(DOMAIN)
        .with_www(true)
        .tag("project", "site")
        .with_site_dir(site.path());

    let report = engine.converge(&topology).await;
    assert_success(&report);

    let state = cloud.snapshot();

    let certificates: Vec<_> = state.certificates.values().map(|c| &c.record).collect();
    assert_eq!(certificates.len(), 1);
    assert_eq!(certificates[0].state, CertificateState::Validated);
    let names: BTreeSet<&str> = certificates[0].domain_names.iter().map(String::as_str).collect();
    assert_eq!(names, BTreeSet::from(["example.test", "www.example.test"]));

    let store = &state.stores[DOMAIN];
    assert!(store.store.public_access_block.is_locked());
    assert!(store.store.versioning);
    assert_eq!(store.store.tags.get("project").map(String::as_str), Some("site"));

    assert_eq!(state.distributions.len(), 1);
    let distribution = state.distributions.values().next().unwrap();
    assert_eq!(
        distribution.config.aliases,
        vec!["example.test".to_string(), "www.example.test".to_string()]
    );
    assert_eq!(distribution.config.certificate_id, certificates[0].id);

    let policy = store.policy.as_ref().expect("policy attached");
    assert_eq!(policy.statement.len(), 1);
    assert!(policy.foreign_statements().next().is_none());

    assert_eq!(
        alias_names(&cloud),
        BTreeSet::from([
            ("example.test".to_string(), RecordType::A),
            ("example.test".to_string(), RecordType::AAAA),
            ("www.example.test".to_string(), RecordType::A),
            ("www.example.test".to_string(), RecordType::AAAA),
        ])
    );

    assert_eq!(report.outputs["distribution_id"], distribution.id);
    assert!(report.outputs.contains_key("invalidation_id"));
}

#[tokio::test(start_paused = true)]
async fn test_site_served_through_rewrite_rule() {
    let (cloud, engine) = setup();
    let site = TempDir::new().unwrap();
    write_site(site.path());
    let topology = DomainTopology::new(DOMAIN).with_www(true).with_site_dir(site.path());

    assert_success(&engine.converge(&topology).await);

    let redirect = cloud.simulate_request("https://example.test/projects").unwrap();
    assert_eq!(redirect.status, 301);
    assert_eq!(redirect.location.as_deref(), Some("/projects/"));

    let page = cloud.simulate_request("https://www.example.test/projects/").unwrap();
    assert_eq!(page.status, 200);
    assert_eq!(page.body_text(), "<h1>projects</h1>");
    assert_eq!(page.content_type.as_deref(), Some("text/html; charset=utf-8"));

    let with_query = cloud.simulate_request("https://example.test/projects/?utm=x").unwrap();
    assert_eq!(with_query.cache_key, page.cache_key);

    let with_port = cloud.simulate_request("https://example.test:8443/projects/").unwrap();
    assert_eq!(with_port.status, 200);
    assert_eq!(with_port.cache_key, page.cache_key);

    let missing = cloud.simulate_request("https://example.test/missing.html").unwrap();
    assert_eq!(missing.status, 404);
    assert_eq!(missing.body_text(), "<h1>not found</h1>");

    let plain = cloud.simulate_request("http://example.test/").unwrap();
    assert_eq!(plain.status, 301);
    assert_eq!(plain.location.as_deref(), Some("https://example.test/"));
}

#[tokio::test(start_paused = true)]
async fn test_second_run_is_noop() {
    let (cloud, engine) = setup();
    let site = TempDir::new().unwrap();
    write_site(site.path());
    let topology = DomainTopology::new(DOMAIN).with_www(true).with_site_dir(site.path());

    assert_success(&engine.converge(&topology).await);
    let mutations = cloud.journal().len();

    let second = engine.converge(&topology).await;
    assert_success(&second);
    assert!(second.is_noop(), "unexpected changes: {:?}", second.components);
    assert_eq!(cloud.journal().len(), mutations);
}

#[tokio::test(start_paused = true)]
async fn test_certificate_swap_never_unbinds_a_live_certificate() {
    let (cloud, engine) = setup();
    let apex_only = DomainTopology::new(DOMAIN);
    let with_www = DomainTopology::new(DOMAIN).with_www(true);

    assert_success(&engine.converge(&apex_only).await);
    assert_success(&engine.converge(&with_www).await);
    assert_success(&engine.converge(&apex_only).await);

    // Replay the journal: a certificate is only deleted once nothing serves
    // it, and a distribution only ever points at a validated certificate
    let mut validated = BTreeSet::new();
    let mut bound: BTreeMap<String, String> = BTreeMap::new();
    let mut deleted = 0;

    for event in cloud.journal() {
        match event.kind {
            JournalKind::CertificateValidated { id } => {
                validated.insert(id);
            }
            JournalKind::DistributionCreated { id, certificate_id }
            | JournalKind::DistributionUpdated { id, certificate_id } => {
                assert!(
                    validated.contains(&certificate_id),
                    "distribution {} bound to unvalidated {}",
                    id,
                    certificate_id
                );
                bound.insert(id, certificate_id);
            }
            JournalKind::CertificateDeleted { id } => {
                assert!(
                    !bound.values().any(|c| c == &id),
                    "certificate {} deleted while bound",
                    id
                );
                deleted += 1;
            }
            _ => {}
        }
    }

    assert_eq!(deleted, 2);
    assert_eq!(cloud.snapshot().certificates.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expiring_certificate_is_renewed_in_place() {
    let (cloud, engine) = setup();
    let topology = DomainTopology::new(DOMAIN).with_www(true);
    assert_success(&engine.converge(&topology).await);

    // Move the bound certificate into the renewal window
    let mut state = cloud.snapshot();
    let (distribution_id, old_id) = {
        let distribution = state.distributions.values().next().unwrap();
        (distribution.id.clone(), distribution.config.certificate_id.clone())
    };
    let renew_before = EngineConfig::default().validation.renew_before_days;
    state.certificates.get_mut(&old_id).unwrap().record.not_after =
        Some(Utc::now() + ChronoDuration::days(renew_before - 1));

    let cloud = Arc::new(InMemoryCloud::from_state(state));
    let engine = ConvergenceEngine::new(cloud.clone(), EngineConfig::default());
    let report = engine.converge(&topology).await;
    assert_success(&report);

    let state = cloud.snapshot();
    assert_eq!(state.distributions.len(), 1);
    let new_id = state.distributions[&distribution_id].config.certificate_id.clone();
    assert_ne!(new_id, old_id);
    assert_eq!(state.certificates[&new_id].record.state, CertificateState::Validated);
    assert!(!state.certificates.contains_key(&old_id));

    let distribution_changes = &report.component(Component::Distribution).unwrap().changes;
    assert!(distribution_changes
        .iter()
        .any(|c| c.resource == format!("distribution {}", distribution_id) && c.action == Action::Updated));

    // Validated, then bound in place, then the old one retired
    let mut validated = None;
    let mut bound = None;
    let mut retired = None;
    for event in cloud.journal() {
        match event.kind {
            JournalKind::CertificateValidated { id } if id == new_id => validated = Some(event.seq),
            JournalKind::DistributionUpdated { id, certificate_id }
                if id == distribution_id && certificate_id == new_id =>
            {
                bound = Some(event.seq)
            }
            JournalKind::DistributionCreated { id, .. } if id != distribution_id => {
                panic!("renewal created a second distribution {}", id)
            }
            JournalKind::CertificateDeleted { id } if id == old_id => retired = Some(event.seq),
            _ => {}
        }
    }

    let (validated, bound, retired) = (validated.unwrap(), bound.unwrap(), retired.unwrap());
    assert!(validated < bound, "bound before validation");
    assert!(bound < retired, "old certificate deleted while bound");
}

#[tokio::test(start_paused = true)]
async fn test_disabling_www_removes_its_aliases() {
    let (cloud, engine) = setup();

    assert_success(&engine.converge(&DomainTopology::new(DOMAIN).with_www(true)).await);
    let report = engine.converge(&DomainTopology::new(DOMAIN)).await;
    assert_success(&report);

    assert_eq!(
        alias_names(&cloud),
        BTreeSet::from([
            ("example.test".to_string(), RecordType::A),
            ("example.test".to_string(), RecordType::AAAA),
        ])
    );

    let state = cloud.snapshot();
    let certificate = &state.certificates.values().next().unwrap().record;
    assert_eq!(certificate.domain_names, vec!["example.test".to_string()]);
    let distribution = state.distributions.values().next().unwrap();
    assert_eq!(distribution.config.aliases, vec!["example.test".to_string()]);

    let deletes: Vec<&str> = report
        .component(Component::Aliases)
        .unwrap()
        .changes
        .iter()
        .filter(|c| c.action == Action::Deleted)
        .map(|c| c.resource.as_str())
        .collect();
    assert!(deletes.contains(&"A www.example.test"));
    assert!(deletes.contains(&"AAAA www.example.test"));
}

#[tokio::test(start_paused = true)]
async fn test_origin_reads_scoped_to_distribution() {
    let (cloud, engine) = setup();
    let site = TempDir::new().unwrap();
    write_site(site.path());

    assert_success(&engine.converge(&DomainTopology::new(DOMAIN).with_site_dir(site.path())).await);

    let state = cloud.snapshot();
    let distribution = state.distributions.values().next().unwrap();
    let other = "arn:aws:cloudfront::000000000000:distribution/EOTHERDIST";

    let (status, object) = cloud.origin_read(DOMAIN, "index.html", Some(&distribution.arn)).unwrap();
    assert_eq!(status, 200);
    assert!(object.is_some());

    let (status, _) = cloud.origin_read(DOMAIN, "absent.html", Some(&distribution.arn)).unwrap();
    assert_eq!(status, 404);

    let (status, _) = cloud.origin_read(DOMAIN, "index.html", Some(other)).unwrap();
    assert_eq!(status, 403);

    let (status, _) = cloud.origin_read(DOMAIN, "index.html", None).unwrap();
    assert_eq!(status, 403);
}

#[tokio::test(start_paused = true)]
async fn test_missing_zone_reports_and_mutates_nothing() {
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_hosted_zone("other.test", false);
    let engine = ConvergenceEngine::new(cloud.clone(), EngineConfig::default());
    let before = cloud.journal().len();

    let report = engine.converge(&DomainTopology::new(DOMAIN)).await;

    assert!(!report.success);
    assert_eq!(report.error.as_ref().unwrap().kind, "ZoneNotFound");
    assert_eq!(
        report.component(Component::Zone).unwrap().status,
        ComponentStatus::Failed
    );
    assert_eq!(
        report.component(Component::Aliases).unwrap().status,
        ComponentStatus::Skipped
    );
    assert_eq!(cloud.journal().len(), before);
}

#[tokio::test(start_paused = true)]
async fn test_foreign_cname_blocks_alias() {
    let (cloud, engine) = setup();
    let zone = cloud.snapshot().zones[0].clone();
    cloud
        .upsert_record_set(
            &zone.id,
            &RecordSet::simple("www.example.test", RecordType::CNAME, 300, "elsewhere.test"),
        )
        .await
        .unwrap();

    let report = engine.converge(&DomainTopology::new(DOMAIN).with_www(true)).await;

    assert!(!report.success);
    assert_eq!(report.error.as_ref().unwrap().kind, "AliasConflict");
    assert_eq!(
        report.component(Component::Aliases).unwrap().status,
        ComponentStatus::Failed
    );

    // The foreign record survives untouched
    let records = cloud.list_record_sets(&zone.id, "www.example.test").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record_type, RecordType::CNAME);
}

#[tokio::test(start_paused = true)]
async fn test_foreign_policy_statement_is_a_conflict() {
    let (cloud, engine) = setup();
    let store = cloud.create_store(DOMAIN, &BTreeMap::new()).await.unwrap();
    let foreign = PolicyDocument {
        version: "2012-10-17".to_string(),
        statement: vec![Statement {
            sid: Some("AnalyticsRead".to_string()),
            effect: Effect::Allow,
            principal: Principal {
                service: Vec::new(),
                aws: vec!["arn:aws:iam::111111111111:root".to_string()],
            },
            action: vec!["s3:GetObject".to_string()],
            resource: vec![format!("{}/*", store.arn)],
            condition: BTreeMap::new(),
        }],
    };
    cloud.put_policy(DOMAIN, &foreign).await.unwrap();

    let report = engine.converge(&DomainTopology::new(DOMAIN)).await;

    assert!(!report.success);
    assert_eq!(report.error.as_ref().unwrap().kind, "PolicyConflict");
    assert_eq!(
        report.component(Component::Distribution).unwrap().status,
        ComponentStatus::Converged
    );
    assert_eq!(cloud.get_policy(DOMAIN).await.unwrap(), Some(foreign));
}
