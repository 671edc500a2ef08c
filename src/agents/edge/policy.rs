//! Access Policy Binder
//!
//! Grants the edge tier read access to the origin store, scoped to a single
//! distribution through an `AWS:SourceArn` condition. Statements written by
//! this engine carry a `Sid` with the [`MANAGED_SID_PREFIX`]; anything else in
//! an existing policy is treated as foreign and never overwritten.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::{ComponentContext, ConvergeError};
use super::providers::StoreApi;
use super::types::{AccessIdentity, Action, Component, EdgeDistribution, OriginStore};

/// Service principal of the edge tier
pub const EDGE_SERVICE_PRINCIPAL: &str = "cloudfront.amazonaws.com";

/// Statement ids starting with this prefix belong to the engine
pub const MANAGED_SID_PREFIX: &str = "EdgeEngine";

pub const READ_ACTION: &str = "s3:GetObject";
pub const SOURCE_ARN_KEY: &str = "AWS:SourceArn";

const POLICY_VERSION: &str = "2012-10-17";

// ============================================================
// Policy Document
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", from = "RawPrincipal")]
pub struct Principal {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service: Vec<String>,
    /// Account principals, `*` for anyone
    #[serde(rename = "AWS", default, skip_serializing_if = "Vec::is_empty")]
    pub aws: Vec<String>,
}

/// Principal as written in stored policies: `"*"` or a map of lists/strings
#[derive(Deserialize)]
#[serde(untagged)]
enum RawPrincipal {
    Anyone(String),
    Named {
        #[serde(rename = "Service", default, deserialize_with = "one_or_many")]
        service: Vec<String>,
        #[serde(rename = "AWS", default, deserialize_with = "one_or_many")]
        aws: Vec<String>,
    },
}

impl From<RawPrincipal> for Principal {
    fn from(raw: RawPrincipal) -> Self {
        match raw {
            RawPrincipal::Anyone(who) => Principal {
                service: Vec::new(),
                aws: vec![who],
            },
            RawPrincipal::Named { service, aws } => Principal { service, aws },
        }
    }
}

/// Stored policies collapse single-element lists to a bare string
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: Effect,
    pub principal: Principal,
    #[serde(deserialize_with = "one_or_many")]
    pub action: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub resource: Vec<String>,
    /// Operator -> (key -> value); only `StringEquals` is understood
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub condition: BTreeMap<String, BTreeMap<String, String>>,
}

impl Statement {
    pub fn is_managed(&self) -> bool {
        self.sid
            .as_deref()
            .map(|sid| sid.starts_with(MANAGED_SID_PREFIX))
            .unwrap_or(false)
    }

    fn matches(&self, request: &AccessRequest) -> bool {
        let principal_ok = self.principal.aws.iter().any(|p| p == "*")
            || request
                .service
                .as_deref()
                .map(|svc| self.principal.service.iter().any(|p| p == svc))
                .unwrap_or(false);

        principal_ok
            && self.action.iter().any(|a| glob_match(a, &request.action))
            && self.resource.iter().any(|r| glob_match(r, &request.resource))
            && self.conditions_hold(request)
    }

    fn conditions_hold(&self, request: &AccessRequest) -> bool {
        self.condition.iter().all(|(operator, entries)| {
            operator == "StringEquals"
                && entries.iter().all(|(key, expected)| {
                    key == SOURCE_ARN_KEY && request.source_arn.as_deref() == Some(expected.as_str())
                })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    /// Read grant for exactly one distribution
    pub fn edge_read(store_arn: &str, distribution_arn: &str) -> Self {
        let mut condition = BTreeMap::new();
        condition.insert(
            "StringEquals".to_string(),
            BTreeMap::from([(SOURCE_ARN_KEY.to_string(), distribution_arn.to_string())]),
        );

        Self {
            version: POLICY_VERSION.to_string(),
            statement: vec![Statement {
                sid: Some(format!("{}EdgeRead", MANAGED_SID_PREFIX)),
                effect: Effect::Allow,
                principal: Principal {
                    service: vec![EDGE_SERVICE_PRINCIPAL.to_string()],
                    aws: Vec::new(),
                },
                action: vec![READ_ACTION.to_string()],
                resource: vec![format!("{}/*", store_arn)],
                condition,
            }],
        }
    }

    /// Statements not written by the engine
    pub fn foreign_statements(&self) -> impl Iterator<Item = &Statement> {
        self.statement.iter().filter(|s| !s.is_managed())
    }

    /// Evaluate a request; explicit deny beats allow, default is deny
    pub fn evaluate(&self, request: &AccessRequest) -> Decision {
        let mut allowed = false;
        for statement in self.statement.iter().filter(|s| s.matches(request)) {
            match statement.effect {
                Effect::Deny => return Decision::Deny,
                Effect::Allow => allowed = true,
            }
        }

        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

/// `*` matches any run of characters
fn glob_match(pattern: &str, value: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == value,
        Some((prefix, rest)) => {
            if !value.starts_with(prefix) {
                return false;
            }
            let tail = &value[prefix.len()..];
            if rest.is_empty() {
                return true;
            }
            (0..=tail.len())
                .filter(|i| tail.is_char_boundary(*i))
                .any(|i| glob_match(rest, &tail[i..]))
        }
    }
}

/// A read attempt against a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    /// Calling service principal, `None` for anonymous callers
    pub service: Option<String>,
    pub action: String,
    pub resource: String,
    /// Distribution the request originates from
    pub source_arn: Option<String>,
}

impl AccessRequest {
    pub fn edge_read(store_arn: &str, key: &str, distribution_arn: &str) -> Self {
        Self {
            service: Some(EDGE_SERVICE_PRINCIPAL.to_string()),
            action: READ_ACTION.to_string(),
            resource: format!("{}/{}", store_arn, key.trim_start_matches('/')),
            source_arn: Some(distribution_arn.to_string()),
        }
    }

    pub fn anonymous_read(store_arn: &str, key: &str) -> Self {
        Self {
            service: None,
            action: READ_ACTION.to_string(),
            resource: format!("{}/{}", store_arn, key.trim_start_matches('/')),
            source_arn: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allow,
    Deny,
}

// ============================================================
// Binder
// ============================================================

#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    pub policy: PolicyDocument,
    pub action: Action,
}

pub struct AccessPolicyBinder {
    api: Arc<dyn StoreApi>,
}

impl AccessPolicyBinder {
    pub fn new(api: Arc<dyn StoreApi>) -> Self {
        Self { api }
    }

    /// Bind the store policy to `distribution`, reached through `identity`
    pub async fn grant_read(
        &self,
        store: &OriginStore,
        identity: &AccessIdentity,
        distribution: &EdgeDistribution,
    ) -> Result<PolicyOutcome, ConvergeError> {
        if distribution.config.origin.access_identity_id != identity.id {
            return Err(ConvergeError::provisioning(
                Component::AccessPolicy,
                anyhow::anyhow!(
                    "distribution {} reaches its origin through {}, not {}",
                    distribution.id,
                    distribution.config.origin.access_identity_id,
                    identity.id
                ),
            ));
        }

        let desired = PolicyDocument::edge_read(&store.arn, &distribution.arn);
        let existing = self
            .api
            .get_policy(&store.name)
            .await
            .within(Component::AccessPolicy)?;

        let action = match existing {
            None => Action::Created,
            Some(current) if current == desired => {
                debug!(store = %store.name, "Store policy unchanged");
                return Ok(PolicyOutcome {
                    policy: current,
                    action: Action::Unchanged,
                });
            }
            Some(current) => {
                let foreign: Vec<String> = current
                    .foreign_statements()
                    .map(|s| s.sid.clone().unwrap_or_else(|| "<no sid>".to_string()))
                    .collect();

                if !foreign.is_empty() {
                    warn!(store = %store.name, statements = ?foreign, "Store policy has unmanaged statements");
                    return Err(ConvergeError::PolicyConflict {
                        store: store.name.clone(),
                        detail: format!("unmanaged statements: {}", foreign.join(", ")),
                    });
                }
                Action::Updated
            }
        };

        self.api
            .put_policy(&store.name, &desired)
            .await
            .within(Component::AccessPolicy)?;

        info!(
            store = %store.name,
            distribution = %distribution.id,
            action = ?action,
            "Bound store policy to distribution"
        );

        Ok(PolicyOutcome {
            policy: desired,
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORE: &str = "arn:aws:s3:::example.test";
    const DIST_X: &str = "arn:aws:cloudfront::000000000000:distribution/EX";
    const DIST_Y: &str = "arn:aws:cloudfront::000000000000:distribution/EY";

    #[test]
    fn test_read_scoped_to_one_distribution() {
        let policy = PolicyDocument::edge_read(STORE, DIST_X);

        assert_eq!(
            policy.evaluate(&AccessRequest::edge_read(STORE, "/index.html", DIST_X)),
            Decision::Allow
        );
        assert_eq!(
            policy.evaluate(&AccessRequest::edge_read(STORE, "/index.html", DIST_Y)),
            Decision::Deny
        );
        assert_eq!(
            policy.evaluate(&AccessRequest::anonymous_read(STORE, "/index.html")),
            Decision::Deny
        );
    }

    #[test]
    fn test_stored_policy_with_bare_strings() {
        let raw = r#"{
            "Version": "2012-10-17",
            "Statement": [
                {
                    "Sid": "EdgeEngineEdgeRead",
                    "Effect": "Allow",
                    "Principal": {"Service": "cloudfront.amazonaws.com"},
                    "Action": "s3:GetObject",
                    "Resource": "arn:aws:s3:::example.test/*",
                    "Condition": {"StringEquals": {"AWS:SourceArn": "arn:aws:cloudfront::000000000000:distribution/EX"}}
                },
                {"Effect": "Allow", "Principal": "*", "Action": ["s3:GetObject"], "Resource": ["arn:aws:s3:::example.test/*"]}
            ]
        }"#;
        let policy: PolicyDocument = serde_json::from_str(raw).unwrap();

        assert_eq!(policy.statement[0], PolicyDocument::edge_read(STORE, DIST_X).statement[0]);
        assert_eq!(policy.statement[1].principal.aws, vec!["*".to_string()]);
        assert_eq!(policy.foreign_statements().count(), 1);
    }

    #[test]
    fn test_explicit_deny_wins() {
        let mut policy = PolicyDocument::edge_read(STORE, DIST_X);
        policy.statement.push(Statement {
            sid: Some("DenySecrets".to_string()),
            effect: Effect::Deny,
            principal: Principal {
                service: Vec::new(),
                aws: vec!["*".to_string()],
            },
            action: vec!["s3:*".to_string()],
            resource: vec![format!("{}/private/*", STORE)],
            condition: BTreeMap::new(),
        });

        assert_eq!(
            policy.evaluate(&AccessRequest::edge_read(STORE, "private/key.txt", DIST_X)),
            Decision::Deny
        );
        assert_eq!(
            policy.evaluate(&AccessRequest::edge_read(STORE, "public/a.css", DIST_X)),
            Decision::Allow
        );
        assert_eq!(policy.foreign_statements().count(), 1);
    }

    #[test]
    fn test_policy_wire_format() {
        let policy = PolicyDocument::edge_read(STORE, DIST_X);
        let json = serde_json::to_value(&policy).unwrap();

        assert_eq!(json["Version"], "2012-10-17");
        let statement = &json["Statement"][0];
        assert_eq!(statement["Sid"], "EdgeEngineEdgeRead");
        assert_eq!(statement["Principal"]["Service"][0], EDGE_SERVICE_PRINCIPAL);
        assert_eq!(statement["Resource"][0], format!("{}/*", STORE));
        assert_eq!(statement["Condition"]["StringEquals"][SOURCE_ARN_KEY], DIST_X);
        assert!(statement["Principal"].get("AWS").is_none());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("s3:*", "s3:GetObject"));
        assert!(glob_match("arn:x/*", "arn:x/a/b.html"));
        assert!(glob_match("a*c*e", "abcde"));
        assert!(!glob_match("arn:x/*", "arn:y/a"));
        assert!(!glob_match("s3:GetObject", "s3:PutObject"));
    }
}
