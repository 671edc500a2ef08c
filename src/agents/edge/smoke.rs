//! Smoke Verification
//!
//! HTTP checks of a converged site: HTTPS reachability of every hostname,
//! the HTTP -> HTTPS redirect, the trailing-slash redirect and the 404 page.
//! Checks run with redirects disabled so each response is checked as sent.

use anyhow::{Context, Result};
use reqwest::{redirect::Policy, Client};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use super::memory::InMemoryCloud;
use super::rewrite::RewriteRule;
use super::types::DomainTopology;

const CHECK_PATH: &str = "/edge-engine-check";
const MISSING_PATH: &str = "/edge-engine-missing.html";

/// One expected response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmokeCheck {
    pub name: String,
    pub url: String,
    pub expected_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmokeResult {
    pub check: String,
    pub url: String,
    pub passed: bool,
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Checks for every hostname of `topology`
pub fn smoke_checks(topology: &DomainTopology, rule: &RewriteRule) -> Vec<SmokeCheck> {
    let apex = &topology.domain;
    let mut checks = vec![
        SmokeCheck {
            name: "https-apex".to_string(),
            url: format!("https://{}/", apex),
            expected_status: 200,
            expected_location: None,
        },
        SmokeCheck {
            name: "http-redirect".to_string(),
            url: format!("http://{}/", apex),
            expected_status: 301,
            expected_location: Some(format!("https://{}/", apex)),
        },
        SmokeCheck {
            name: "trailing-slash".to_string(),
            url: format!("https://{}{}", apex, CHECK_PATH),
            expected_status: rule.redirect_status,
            expected_location: Some(format!("{}/", CHECK_PATH)),
        },
        SmokeCheck {
            name: "missing-page".to_string(),
            url: format!("https://{}{}", apex, MISSING_PATH),
            expected_status: 404,
            expected_location: None,
        },
    ];

    if topology.enable_www {
        checks.push(SmokeCheck {
            name: "https-www".to_string(),
            url: format!("https://{}/", topology.www_name()),
            expected_status: 200,
            expected_location: None,
        });
    }
    checks
}

/// Compare an observed response with the check
pub fn evaluate(check: &SmokeCheck, status: u16, location: Option<&str>) -> SmokeResult {
    let mut problems = Vec::new();
    if status != check.expected_status {
        problems.push(format!("expected status {}, got {}", check.expected_status, status));
    }
    if let Some(expected) = &check.expected_location {
        if location != Some(expected.as_str()) {
            problems.push(format!(
                "expected location {}, got {}",
                expected,
                location.unwrap_or("<none>")
            ));
        }
    }

    SmokeResult {
        check: check.name.clone(),
        url: check.url.clone(),
        passed: problems.is_empty(),
        status: Some(status),
        detail: (!problems.is_empty()).then(|| problems.join("; ")),
    }
}

/// Live checks over HTTP
pub struct SmokeVerifier {
    client: Client,
}

impl SmokeVerifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::none())
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    pub async fn verify(&self, checks: &[SmokeCheck]) -> Vec<SmokeResult> {
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            let result = match self.client.get(&check.url).send().await {
                Ok(response) => {
                    let location = response
                        .headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    evaluate(check, response.status().as_u16(), location.as_deref())
                }
                Err(e) => SmokeResult {
                    check: check.name.clone(),
                    url: check.url.clone(),
                    passed: false,
                    status: None,
                    detail: Some(format!("request failed: {}", e)),
                },
            };
            log_result(&result);
            results.push(result);
        }
        results
    }
}

/// Run the checks against the simulated account instead of the network
pub fn verify_simulated(cloud: &InMemoryCloud, checks: &[SmokeCheck]) -> Vec<SmokeResult> {
    checks
        .iter()
        .map(|check| {
            let result = match cloud.simulate_request(&check.url) {
                Ok(response) => evaluate(check, response.status, response.location.as_deref()),
                Err(e) => SmokeResult {
                    check: check.name.clone(),
                    url: check.url.clone(),
                    passed: false,
                    status: None,
                    detail: Some(format!("{:#}", e)),
                },
            };
            log_result(&result);
            result
        })
        .collect()
}

fn log_result(result: &SmokeResult) {
    if result.passed {
        info!(check = %result.check, url = %result.url, "Smoke check passed");
    } else {
        warn!(
            check = %result.check,
            url = %result.url,
            detail = result.detail.as_deref().unwrap_or(""),
            "Smoke check failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checks_cover_www_only_when_enabled() {
        let rule = RewriteRule::default();
        let apex_only = smoke_checks(&DomainTopology::new("example.test"), &rule);
        assert_eq!(apex_only.len(), 4);

        let with_www = smoke_checks(&DomainTopology::new("example.test").with_www(true), &rule);
        assert_eq!(with_www.len(), 5);
        assert_eq!(with_www[4].url, "https://www.example.test/");
    }

    #[test]
    fn test_evaluate_status_and_location() {
        let checks = smoke_checks(&DomainTopology::new("example.test"), &RewriteRule::default());
        let slash = &checks[2];

        assert!(evaluate(slash, 301, Some("/edge-engine-check/")).passed);

        let wrong = evaluate(slash, 200, None);
        assert!(!wrong.passed);
        let detail = wrong.detail.unwrap();
        assert!(detail.contains("expected status 301, got 200"));
        assert!(detail.contains("got <none>"));
    }
}
