//! Zone Resolver
//!
//! Finds the authoritative public zone for a domain. Read-only.

use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ComponentContext, ConvergeError};
use super::providers::ZoneApi;
use super::types::{normalize_name, Component, HostedZone};

pub struct ZoneResolver {
    api: Arc<dyn ZoneApi>,
}

impl ZoneResolver {
    pub fn new(api: Arc<dyn ZoneApi>) -> Self {
        Self { api }
    }

    /// Resolve the zone owning `domain`
    pub async fn resolve(&self, domain: &str) -> Result<HostedZone, ConvergeError> {
        let zones = self
            .api
            .list_hosted_zones()
            .await
            .within(Component::Zone)?;

        debug!(domain = %domain, candidates = zones.len(), "Resolving hosted zone");

        let zone = select_zone(&zones, domain).ok_or_else(|| ConvergeError::ZoneNotFound {
            domain: domain.to_string(),
        })?;

        info!(domain = %domain, zone_id = %zone.id, zone = %zone.name, "Resolved hosted zone");
        Ok(zone.clone())
    }
}

/// Longest-suffix match among public zones
pub fn select_zone<'a>(zones: &'a [HostedZone], domain: &str) -> Option<&'a HostedZone> {
    let domain = normalize_name(domain);

    zones
        .iter()
        .filter(|z| !z.private)
        .filter(|z| {
            let zone = normalize_name(&z.name);
            domain == zone || domain.ends_with(&format!(".{}", zone))
        })
        .max_by_key(|z| normalize_name(&z.name).len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: &str, name: &str, private: bool) -> HostedZone {
        HostedZone {
            id: id.to_string(),
            name: name.to_string(),
            private,
        }
    }

    #[test]
    fn test_longest_suffix_wins() {
        let zones = vec![
            zone("Z1", "example.test.", false),
            zone("Z2", "site.example.test", false),
            zone("Z3", "other.test", false),
        ];

        assert_eq!(select_zone(&zones, "site.example.test").unwrap().id, "Z2");
        assert_eq!(select_zone(&zones, "www.site.example.test").unwrap().id, "Z2");
        assert_eq!(select_zone(&zones, "example.test").unwrap().id, "Z1");
    }

    #[test]
    fn test_partial_label_is_not_a_match() {
        let zones = vec![zone("Z1", "ample.test", false)];
        assert!(select_zone(&zones, "example.test").is_none());
    }

    #[test]
    fn test_private_zones_are_ignored() {
        let zones = vec![
            zone("Z1", "example.test", true),
            zone("Z2", "test", false),
        ];
        assert_eq!(select_zone(&zones, "example.test").unwrap().id, "Z2");

        let zones = vec![zone("Z1", "example.test", true)];
        assert!(select_zone(&zones, "example.test").is_none());
    }
}
