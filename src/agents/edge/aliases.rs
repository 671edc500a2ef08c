//! DNS Alias Binder
//!
//! Points the apex (and `www` when enabled) at the edge distribution with
//! A + AAAA alias records. Ownership of a name is recorded in a TXT marker
//! next to it (`<prefix>.<name>`); names held by anything else are never
//! touched.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ComponentContext, ConvergeError};
use super::providers::RecordApi;
use super::types::{
    AliasRecord, AliasTarget, Action, Change, Component, DomainTopology, EdgeDistribution,
    HostedZone, RecordSet, RecordType,
};

/// Hosted zone id shared by every edge distribution endpoint
pub const EDGE_HOSTED_ZONE_ID: &str = "Z2FDTNDATAQYW2";

const OWNER_TTL: u32 = 300;
const ALIAS_TYPES: [RecordType; 2] = [RecordType::A, RecordType::AAAA];

/// TXT marker identifying the site that owns a name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerMarker {
    prefix: String,
    value: String,
}

impl OwnerMarker {
    pub fn new(prefix: &str, domain: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            value: format!("heritage=edge-engine,owner={}", domain),
        }
    }

    pub fn record_name(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }

    pub fn record(&self, name: &str) -> RecordSet {
        RecordSet::simple(&self.record_name(name), RecordType::TXT, OWNER_TTL, &self.value)
    }

    fn owns(&self, records: &[RecordSet]) -> bool {
        records
            .iter()
            .any(|r| r.record_type == RecordType::TXT && r.values.iter().any(|v| v == &self.value))
    }
}

/// One step of an alias plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasStep {
    Upsert { record: RecordSet, action: Action },
    Delete { name: String, record_type: RecordType },
    Keep { name: String, record_type: RecordType },
}

impl AliasStep {
    pub fn to_change(&self) -> Change {
        match self {
            AliasStep::Upsert { record, action } => {
                Change::new(format!("{} {}", record.record_type, record.name), *action)
            }
            AliasStep::Delete { name, record_type } => {
                Change::new(format!("{} {}", record_type, name), Action::Deleted)
            }
            AliasStep::Keep { name, record_type } => {
                Change::new(format!("{} {}", record_type, name), Action::Unchanged)
            }
        }
    }
}

/// Alias records for every hostname of the topology
pub fn desired_aliases(topology: &DomainTopology, distribution: &EdgeDistribution) -> Vec<AliasRecord> {
    let target = AliasTarget {
        dns_name: distribution.domain_name.clone(),
        hosted_zone_id: EDGE_HOSTED_ZONE_ID.to_string(),
        evaluate_target_health: false,
    };

    topology
        .hostnames()
        .into_iter()
        .flat_map(|hostname| {
            let target = target.clone();
            ALIAS_TYPES.into_iter().map(move |record_type| AliasRecord {
                hostname: hostname.clone(),
                record_type,
                target: target.clone(),
            })
        })
        .collect()
}

/// Plan the record changes for `desired` names and `retired` names given
/// what is observed in the zone. `observed` maps each name (alias names and
/// their owner markers) to the record sets found there.
pub fn plan_aliases(
    desired: &[AliasRecord],
    retired: &[String],
    observed: &BTreeMap<String, Vec<RecordSet>>,
    marker: &OwnerMarker,
) -> Result<Vec<AliasStep>, ConvergeError> {
    let empty = Vec::new();
    let at = |name: &str| observed.get(name).unwrap_or(&empty);

    let mut by_name: BTreeMap<&str, Vec<&AliasRecord>> = BTreeMap::new();
    for alias in desired {
        by_name.entry(alias.hostname.as_str()).or_default().push(alias);
    }

    let mut steps = Vec::new();

    for (&name, aliases) in &by_name {
        let existing = at(name);
        let owned = marker.owns(at(&marker.record_name(name)));

        if !owned {
            // Anything at the name other than our exact records is foreign
            let foreign = existing.iter().find(|r| {
                is_address_type(r.record_type)
                    && !aliases.iter().any(|a| a.to_record_set() == **r)
            });
            if let Some(record) = foreign {
                return Err(ConvergeError::AliasConflict {
                    name: name.to_string(),
                    record_type: record.record_type,
                });
            }
            steps.push(AliasStep::Upsert {
                record: marker.record(name),
                action: Action::Created,
            });
        }

        for cname in existing.iter().filter(|r| r.record_type == RecordType::CNAME) {
            steps.push(AliasStep::Delete {
                name: cname.name.clone(),
                record_type: RecordType::CNAME,
            });
        }

        for alias in aliases {
            let record = alias.to_record_set();
            match existing.iter().find(|r| r.record_type == alias.record_type) {
                Some(current) if *current == record => steps.push(AliasStep::Keep {
                    name: record.name.clone(),
                    record_type: record.record_type,
                }),
                Some(_) => steps.push(AliasStep::Upsert {
                    record,
                    action: Action::Updated,
                }),
                None => steps.push(AliasStep::Upsert {
                    record,
                    action: Action::Created,
                }),
            }
        }
    }

    for name in retired {
        let marker_name = marker.record_name(name);
        if !marker.owns(at(&marker_name)) {
            continue;
        }
        for record in at(name).iter().filter(|r| is_address_type(r.record_type)) {
            steps.push(AliasStep::Delete {
                name: record.name.clone(),
                record_type: record.record_type,
            });
        }
        steps.push(AliasStep::Delete {
            name: marker_name,
            record_type: RecordType::TXT,
        });
    }

    Ok(steps)
}

fn is_address_type(record_type: RecordType) -> bool {
    matches!(record_type, RecordType::A | RecordType::AAAA | RecordType::CNAME)
}

pub struct DnsAliasBinder {
    api: Arc<dyn RecordApi>,
    owner_prefix: String,
}

impl DnsAliasBinder {
    pub fn new(api: Arc<dyn RecordApi>, owner_prefix: impl Into<String>) -> Self {
        Self {
            api,
            owner_prefix: owner_prefix.into(),
        }
    }

    /// Upsert the alias set for `topology` and remove `www` when disabled
    pub async fn ensure_aliases(
        &self,
        zone: &HostedZone,
        topology: &DomainTopology,
        distribution: &EdgeDistribution,
    ) -> Result<Vec<Change>, ConvergeError> {
        let marker = OwnerMarker::new(&self.owner_prefix, &topology.domain);
        let desired = desired_aliases(topology, distribution);
        let retired: Vec<String> = if topology.enable_www {
            Vec::new()
        } else {
            vec![topology.www_name()]
        };

        let mut observed = BTreeMap::new();
        for name in topology.hostnames().into_iter().chain(retired.iter().cloned()) {
            for lookup in [name.clone(), marker.record_name(&name)] {
                let records = self
                    .api
                    .list_record_sets(&zone.id, &lookup)
                    .await
                    .within(Component::Aliases)?;
                observed.insert(lookup, records);
            }
        }

        let steps = plan_aliases(&desired, &retired, &observed, &marker)?;

        for step in &steps {
            match step {
                AliasStep::Upsert { record, action } => {
                    self.api
                        .upsert_record_set(&zone.id, record)
                        .await
                        .within(Component::Aliases)?;
                    info!(name = %record.name, record_type = %record.record_type, action = ?action, "Upserted record");
                }
                AliasStep::Delete { name, record_type } => {
                    self.api
                        .delete_record_set(&zone.id, name, *record_type)
                        .await
                        .within(Component::Aliases)?;
                    info!(name = %name, record_type = %record_type, "Deleted record");
                }
                AliasStep::Keep { name, record_type } => {
                    debug!(name = %name, record_type = %record_type, "Record unchanged");
                }
            }
        }

        Ok(steps.iter().map(AliasStep::to_change).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::edge::types::{DistributionConfig, DistributionStatus};

    fn distribution(endpoint: &str) -> EdgeDistribution {
        let raw = serde_json::json!({
            "caller_reference": "example.test",
            "comment": "",
            "enabled": true,
            "aliases": [],
            "origin": {"origin_id": "o", "domain_name": "d", "access_identity_id": "i"},
            "certificate_id": "c",
            "minimum_protocol_version": "TLSv1.2_2021",
            "ssl_support_method": "sni-only",
            "viewer_protocol_policy": "redirect-to-https",
            "allowed_methods": [],
            "cached_methods": [],
            "compress": true,
            "forward_query_string": false,
            "forward_cookies": false,
            "ttl": {"min": 0, "default": 3600, "max": 86400},
            "viewer_request_function": "f",
            "custom_errors": [],
            "default_root_object": "index.html",
            "ipv6_enabled": true,
            "http_version": "http2and3",
            "price_class": "PriceClass_100"
        });
        let config: DistributionConfig = serde_json::from_value(raw).unwrap();
        EdgeDistribution {
            id: "EDIST".to_string(),
            arn: "arn:aws:cloudfront::000000000000:distribution/EDIST".to_string(),
            domain_name: endpoint.to_string(),
            status: DistributionStatus::Deployed,
            config,
        }
    }

    fn marker() -> OwnerMarker {
        OwnerMarker::new("_edge-owner", "example.test")
    }

    fn observed_with(records: Vec<RecordSet>) -> BTreeMap<String, Vec<RecordSet>> {
        let mut observed: BTreeMap<String, Vec<RecordSet>> = BTreeMap::new();
        for record in records {
            observed.entry(record.name.clone()).or_default().push(record);
        }
        observed
    }

    #[test]
    fn test_fresh_zone_creates_markers_and_aliases() {
        let topology = DomainTopology::new("example.test").with_www(true);
        let desired = desired_aliases(&topology, &distribution("d1.cloudfront.net"));
        assert_eq!(desired.len(), 4);
        assert!(desired.iter().all(|a| !a.target.evaluate_target_health));

        let steps = plan_aliases(&desired, &[], &BTreeMap::new(), &marker()).unwrap();
        let created: Vec<String> = steps
            .iter()
            .filter_map(|s| match s {
                AliasStep::Upsert { record, action: Action::Created } => {
                    Some(format!("{} {}", record.record_type, record.name))
                }
                _ => None,
            })
            .collect();

        assert_eq!(
            created,
            vec![
                "TXT _edge-owner.example.test",
                "A example.test",
                "AAAA example.test",
                "TXT _edge-owner.www.example.test",
                "A www.example.test",
                "AAAA www.example.test",
            ]
        );
    }

    #[test]
    fn test_converged_zone_is_a_noop() {
        let topology = DomainTopology::new("example.test");
        let desired = desired_aliases(&topology, &distribution("d1.cloudfront.net"));
        let mut records: Vec<RecordSet> = desired.iter().map(AliasRecord::to_record_set).collect();
        records.push(marker().record("example.test"));

        let steps = plan_aliases(&desired, &[], &observed_with(records), &marker()).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| matches!(s, AliasStep::Keep { .. })));
    }

    #[test]
    fn test_foreign_record_is_a_conflict() {
        let topology = DomainTopology::new("example.test").with_www(true);
        let desired = desired_aliases(&topology, &distribution("d1.cloudfront.net"));
        let foreign = RecordSet::simple("www.example.test", RecordType::CNAME, 300, "legacy.host.test");

        let err = plan_aliases(&desired, &[], &observed_with(vec![foreign]), &marker()).unwrap_err();
        match err {
            ConvergeError::AliasConflict { name, record_type } => {
                assert_eq!(name, "www.example.test");
                assert_eq!(record_type, RecordType::CNAME);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_owned_records_follow_new_endpoint() {
        let topology = DomainTopology::new("example.test");
        let old = desired_aliases(&topology, &distribution("d-old.cloudfront.net"));
        let mut records: Vec<RecordSet> = old.iter().map(AliasRecord::to_record_set).collect();
        records.push(marker().record("example.test"));

        let new = desired_aliases(&topology, &distribution("d-new.cloudfront.net"));
        let steps = plan_aliases(&new, &[], &observed_with(records), &marker()).unwrap();

        assert_eq!(steps.len(), 2);
        assert!(steps
            .iter()
            .all(|s| matches!(s, AliasStep::Upsert { action: Action::Updated, .. })));
    }

    #[test]
    fn test_retired_www_only_deleted_when_owned() {
        let topology = DomainTopology::new("example.test").with_www(true);
        let desired = desired_aliases(&topology, &distribution("d1.cloudfront.net"));
        let www: Vec<RecordSet> = desired[2..].iter().map(AliasRecord::to_record_set).collect();
        let retired = vec!["www.example.test".to_string()];

        let unowned = plan_aliases(&[], &retired, &observed_with(www.clone()), &marker()).unwrap();
        assert!(unowned.is_empty());

        let mut owned = www;
        owned.push(marker().record("www.example.test"));
        let steps = plan_aliases(&[], &retired, &observed_with(owned), &marker()).unwrap();
        let deleted: Vec<String> = steps.iter().map(|s| s.to_change().resource).collect();
        assert_eq!(
            deleted,
            vec![
                "A www.example.test",
                "AAAA www.example.test",
                "TXT _edge-owner.www.example.test"
            ]
        );
    }
}
