//! Viewer-Request Rewrite Rule
//!
//! Pure function of the request path, evaluated at the edge before the cache
//! key is computed so that `/foo/` and `/foo/index.html` share one entry.
//!
//! - no trailing slash and no extension in the last segment: redirect to `path/`
//! - trailing slash: rewrite to `path/index.html`
//! - anything else passes through

use serde::{Deserialize, Serialize};

/// Configuration of the rewrite rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteRule {
    /// Document appended to directory paths
    pub index_document: String,
    /// Status used for the trailing-slash redirect
    pub redirect_status: u16,
}

impl Default for RewriteRule {
    fn default() -> Self {
        Self {
            index_document: "index.html".to_string(),
            redirect_status: 301,
        }
    }
}

/// Result of evaluating the rule against one request path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RewriteOutcome {
    Redirect { status: u16, location: String },
    Rewrite { uri: String },
    PassThrough { uri: String },
}

impl RewriteOutcome {
    /// Request URI forwarded to the cache/origin, `None` for redirects
    pub fn forwarded_uri(&self) -> Option<&str> {
        match self {
            RewriteOutcome::Redirect { .. } => None,
            RewriteOutcome::Rewrite { uri } | RewriteOutcome::PassThrough { uri } => Some(uri),
        }
    }
}

impl RewriteRule {
    /// Evaluate the rule for a request path (query string already stripped)
    pub fn evaluate(&self, uri: &str) -> RewriteOutcome {
        if uri.ends_with('/') {
            return RewriteOutcome::Rewrite {
                uri: format!("{}{}", uri, self.index_document),
            };
        }

        let last_segment = match uri.rfind('/') {
            Some(idx) => &uri[idx + 1..],
            None => uri,
        };

        if !last_segment.contains('.') {
            return RewriteOutcome::Redirect {
                status: self.redirect_status,
                location: format!("{}/", uri),
            };
        }

        RewriteOutcome::PassThrough {
            uri: uri.to_string(),
        }
    }

    /// Cache key for a path: the rewritten URI, ignoring any query string
    pub fn cache_key(&self, uri: &str) -> Option<String> {
        let path = uri.split('?').next().unwrap_or(uri);
        self.evaluate(path).forwarded_uri().map(str::to_string)
    }

    /// Render the viewer-request function deployed to the edge tier
    pub fn render_function(&self) -> String {
        format!(
            r#"function handler(event) {{
    var request = event.request;
    var uri = request.uri;
    if (uri.endsWith('/')) {{
        request.uri = uri + '{index}';
        return request;
    }}
    var lastSegment = uri.substring(uri.lastIndexOf('/') + 1);
    if (lastSegment.indexOf('.') === -1) {{
        return {{
            statusCode: {status},
            statusDescription: '{description}',
            headers: {{ location: {{ value: uri + '/' }} }}
        }};
    }}
    return request;
}}
"#,
            index = self.index_document,
            status = self.redirect_status,
            description = status_description(self.redirect_status),
        )
    }
}

fn status_description(status: u16) -> &'static str {
    match status {
        301 => "Moved Permanently",
        302 => "Found",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        _ => "Redirect",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redirect(location: &str) -> RewriteOutcome {
        RewriteOutcome::Redirect {
            status: 301,
            location: location.to_string(),
        }
    }

    #[test]
    fn test_extensionless_path_redirects_with_slash() {
        let rule = RewriteRule::default();
        assert_eq!(rule.evaluate("/projects"), redirect("/projects/"));
        assert_eq!(rule.evaluate("/blog/2024/post"), redirect("/blog/2024/post/"));
    }

    #[test]
    fn test_directory_path_gets_index_document() {
        let rule = RewriteRule::default();
        assert_eq!(
            rule.evaluate("/projects/"),
            RewriteOutcome::Rewrite {
                uri: "/projects/index.html".to_string()
            }
        );
        assert_eq!(
            rule.evaluate("/"),
            RewriteOutcome::Rewrite {
                uri: "/index.html".to_string()
            }
        );
    }

    #[test]
    fn test_file_paths_pass_through() {
        let rule = RewriteRule::default();
        assert_eq!(
            rule.evaluate("/a.css"),
            RewriteOutcome::PassThrough {
                uri: "/a.css".to_string()
            }
        );
        // only the last segment decides
        assert_eq!(rule.evaluate("/v1.2/docs"), redirect("/v1.2/docs/"));
        assert_eq!(
            rule.evaluate("/assets/app.min.js"),
            RewriteOutcome::PassThrough {
                uri: "/assets/app.min.js".to_string()
            }
        );
    }

    #[test]
    fn test_cache_key_collapses_directory_and_index() {
        let rule = RewriteRule::default();
        assert_eq!(rule.cache_key("/foo/"), rule.cache_key("/foo/index.html"));
        assert_eq!(rule.cache_key("/foo/?utm=1"), Some("/foo/index.html".to_string()));
        assert_eq!(rule.cache_key("/foo"), None);
    }

    #[test]
    fn test_rendered_function_uses_configured_values() {
        let rule = RewriteRule {
            index_document: "default.htm".to_string(),
            redirect_status: 308,
        };
        let code = rule.render_function();

        assert!(code.contains("uri + 'default.htm'"));
        assert!(code.contains("statusCode: 308"));
        assert!(code.contains("Permanent Redirect"));
    }
}
