//! Artifact Publisher
//!
//! Syncs a built site directory into the origin store and invalidates the
//! edge cache for whatever changed.

use anyhow::{Context, Result};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ComponentContext, ConvergeError};
use super::providers::{EdgeApi, StoreApi};
use super::types::{Action, Change, Component, ObjectSummary, StoredObject};

/// A file found in the site directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    /// Object key, `/`-separated and relative to the site root
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
    /// Base64 SHA-256, as stored by the object store
    pub checksum_sha256: String,
    /// Hex SHA-256, for logs
    pub digest: String,
    pub content_type: String,
}

/// Uploads and deletions needed to make the store match the directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishPlan {
    pub uploads: Vec<(String, Action)>,
    pub deletes: Vec<String>,
    pub unchanged: usize,
}

impl PublishPlan {
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.deletes.is_empty()
    }

    /// Keys whose cached copies are stale after this plan is applied
    pub fn changed_keys(&self) -> Vec<String> {
        let mut keys: BTreeSet<String> = self.uploads.iter().map(|(k, _)| k.clone()).collect();
        keys.extend(self.deletes.iter().cloned());
        keys.into_iter().collect()
    }
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub changes: Vec<Change>,
    pub invalidation_id: Option<String>,
}

/// Walk `root` and hash every regular file
pub fn scan_site(root: &Path) -> Result<Vec<LocalArtifact>> {
    let mut artifacts = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read site directory {:?}", dir))?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("{:?} is outside {:?}", path, root))?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let body = std::fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?;
            let digest = Sha256::digest(&body);

            artifacts.push(LocalArtifact {
                content_type: content_type(&key),
                key,
                size: body.len() as u64,
                checksum_sha256: base64::engine::general_purpose::STANDARD.encode(digest.as_slice()),
                digest: hex::encode(digest.as_slice()),
                path,
            });
        }
    }

    artifacts.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(artifacts)
}

/// Diff local artifacts against the store listing by checksum
pub fn plan_publish(local: &[LocalArtifact], remote: &[ObjectSummary]) -> PublishPlan {
    let remote: BTreeMap<&str, &ObjectSummary> = remote.iter().map(|o| (o.key.as_str(), o)).collect();
    let local_keys: BTreeSet<&str> = local.iter().map(|a| a.key.as_str()).collect();

    let mut plan = PublishPlan::default();
    for artifact in local {
        match remote.get(artifact.key.as_str()) {
            None => plan.uploads.push((artifact.key.clone(), Action::Created)),
            Some(object) if object.checksum_sha256.as_deref() == Some(artifact.checksum_sha256.as_str()) => {
                plan.unchanged += 1
            }
            Some(_) => plan.uploads.push((artifact.key.clone(), Action::Updated)),
        }
    }

    plan.deletes = remote
        .keys()
        .filter(|k| !local_keys.contains(*k))
        .map(|k| k.to_string())
        .collect();

    plan
}

/// Invalidation paths for the changed keys; collapses to `/*` above `limit`
pub fn invalidation_paths(changed: &[String], limit: usize) -> Vec<String> {
    if changed.is_empty() {
        return Vec::new();
    }
    if changed.len() > limit {
        return vec!["/*".to_string()];
    }
    changed.iter().map(|k| format!("/{}", k)).collect()
}

/// MIME type stored with the object; text types are served as UTF-8
pub fn content_type(key: &str) -> String {
    let mime = mime_guess::from_path(key).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT && mime.get_param(mime_guess::mime::CHARSET).is_none() {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.to_string()
    }
}

pub struct ArtifactPublisher {
    store: Arc<dyn StoreApi>,
    edge: Arc<dyn EdgeApi>,
    invalidation_limit: usize,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn StoreApi>, edge: Arc<dyn EdgeApi>, invalidation_limit: usize) -> Self {
        Self {
            store,
            edge,
            invalidation_limit,
        }
    }

    /// Make the store mirror `site_dir`, then invalidate the changed paths
    pub async fn publish(
        &self,
        store_name: &str,
        distribution_id: &str,
        site_dir: &Path,
    ) -> Result<PublishOutcome, ConvergeError> {
        let local = scan_site(site_dir).within(Component::Publisher)?;
        let remote = self
            .store
            .list_objects(store_name)
            .await
            .within(Component::Publisher)?;

        let plan = plan_publish(&local, &remote);
        debug!(
            store = %store_name,
            uploads = plan.uploads.len(),
            deletes = plan.deletes.len(),
            unchanged = plan.unchanged,
            "Planned publish"
        );

        let by_key: BTreeMap<&str, &LocalArtifact> = local.iter().map(|a| (a.key.as_str(), a)).collect();
        let mut changes = Vec::new();

        for (key, action) in &plan.uploads {
            let Some(artifact) = by_key.get(key.as_str()) else {
                continue;
            };
            let body = tokio::fs::read(&artifact.path)
                .await
                .with_context(|| format!("Failed to read {:?}", artifact.path))
                .within(Component::Publisher)?;

            self.store
                .put_object(
                    store_name,
                    StoredObject {
                        key: key.clone(),
                        content_type: artifact.content_type.clone(),
                        checksum_sha256: artifact.checksum_sha256.clone(),
                        body,
                    },
                )
                .await
                .within(Component::Publisher)?;

            debug!(key = %key, sha256 = %artifact.digest, size = artifact.size, "Uploaded object");
            changes.push(Change::new(format!("object {}", key), *action));
        }

        for key in &plan.deletes {
            self.store
                .delete_object(store_name, key)
                .await
                .within(Component::Publisher)?;
            debug!(key = %key, "Deleted object");
            changes.push(Change::new(format!("object {}", key), Action::Deleted));
        }

        let paths = invalidation_paths(&plan.changed_keys(), self.invalidation_limit);
        let invalidation_id = if paths.is_empty() {
            None
        } else {
            let id = self
                .edge
                .create_invalidation(distribution_id, &paths)
                .await
                .within(Component::Publisher)?;
            info!(distribution = %distribution_id, invalidation = %id, paths = paths.len(), "Requested cache invalidation");
            Some(id)
        };

        info!(
            store = %store_name,
            uploaded = plan.uploads.len(),
            deleted = plan.deletes.len(),
            unchanged = plan.unchanged,
            "Published site"
        );

        Ok(PublishOutcome {
            changes,
            invalidation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn site() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        fs::write(dir.path().join("404.html"), "<h1>missing</h1>").unwrap();
        fs::create_dir_all(dir.path().join("projects")).unwrap();
        fs::write(dir.path().join("projects/index.html"), "<h1>projects</h1>").unwrap();
        fs::write(dir.path().join("projects/app.css"), "body{}").unwrap();
        dir
    }

    #[test]
    fn test_scan_site_keys_and_checksums() {
        let dir = site();
        let artifacts = scan_site(dir.path()).unwrap();
        let keys: Vec<&str> = artifacts.iter().map(|a| a.key.as_str()).collect();

        assert_eq!(
            keys,
            vec!["404.html", "index.html", "projects/app.css", "projects/index.html"]
        );
        let css = &artifacts[2];
        assert_eq!(css.content_type, "text/css; charset=utf-8");
        assert_eq!(css.digest.len(), 64);
        assert_eq!(
            css.checksum_sha256,
            base64::engine::general_purpose::STANDARD.encode(Sha256::digest(b"body{}"))
        );
    }

    #[test]
    fn test_plan_publish_diff() {
        let dir = site();
        let local = scan_site(dir.path()).unwrap();
        let mut remote: Vec<ObjectSummary> = local
            .iter()
            .map(|a| ObjectSummary {
                key: a.key.clone(),
                size: a.size,
                checksum_sha256: Some(a.checksum_sha256.clone()),
            })
            .collect();
        remote[1].checksum_sha256 = Some("stale".to_string());
        remote.push(ObjectSummary {
            key: "old.html".to_string(),
            size: 1,
            checksum_sha256: None,
        });
        remote.remove(0);

        let plan = plan_publish(&local, &remote);
        assert_eq!(
            plan.uploads,
            vec![
                ("404.html".to_string(), Action::Created),
                ("index.html".to_string(), Action::Updated)
            ]
        );
        assert_eq!(plan.deletes, vec!["old.html".to_string()]);
        assert_eq!(plan.unchanged, 2);
        assert_eq!(plan.changed_keys(), vec!["404.html", "index.html", "old.html"]);
    }

    #[test]
    fn test_invalidation_paths_collapse() {
        let keys: Vec<String> = (0..3).map(|i| format!("p{}.html", i)).collect();
        assert_eq!(invalidation_paths(&keys, 3), vec!["/p0.html", "/p1.html", "/p2.html"]);
        assert_eq!(invalidation_paths(&keys, 2), vec!["/*"]);
        assert!(invalidation_paths(&[], 2).is_empty());
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type("index.HTML"), "text/html; charset=utf-8");
        assert_eq!(content_type("fonts/a.woff2"), "font/woff2");
        assert_eq!(content_type("LICENSE"), "application/octet-stream");
        assert_eq!(content_type("media/clip.mp4"), "video/mp4");
        assert_eq!(content_type("audio.mp3"), "audio/mpeg");
        assert_eq!(content_type("data.csv"), "text/csv; charset=utf-8");
        assert_eq!(content_type("img/logo.PNG"), "image/png");
    }
}
