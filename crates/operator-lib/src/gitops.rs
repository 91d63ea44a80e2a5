//! GitOps push of generated packages
//!
//! `DirectoryGitOps` publishes each package into a working tree laid out as
//! `<root>/<namespace>/<package>/`, which a GitOps agent then syncs. The
//! returned revision is derived from the package digest, so pushing the same
//! package twice yields the same revision.

use crate::error::{LifecycleError, LifecycleResult};
use crate::generator::ArtifactSet;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File holding the revision of the package in its directory
pub const REVISION_FILE: &str = ".revision";

/// Publishes artifact sets
#[async_trait]
pub trait GitOpsClient: Send + Sync {
    /// Publish `artifacts` and return the resulting revision
    async fn push(&self, artifacts: &ArtifactSet) -> LifecycleResult<String>;
}

/// GitOps target backed by a local directory tree
#[derive(Debug, Clone)]
pub struct DirectoryGitOps {
    root: PathBuf,
}

impl DirectoryGitOps {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_dir(&self, namespace: &str, package: &str) -> PathBuf {
        self.root.join(namespace).join(package)
    }

    pub fn revision_for(artifacts: &ArtifactSet) -> String {
        let digest = artifacts.digest();
        format!("rev-{}", &digest[..digest.len().min(12)])
    }
}

fn check_component(kind: &str, value: &str) -> LifecycleResult<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains(|c| c == '/' || c == '\\') {
        return Err(LifecycleError::packaging(format!(
            "invalid {} for GitOps path: {:?}",
            kind, value
        )));
    }
    Ok(())
}

fn io_error(path: &Path, e: std::io::Error) -> LifecycleError {
    LifecycleError::Unavailable(format!("gitops write {}: {}", path.display(), e))
}

#[async_trait]
impl GitOpsClient for DirectoryGitOps {
    async fn push(&self, artifacts: &ArtifactSet) -> LifecycleResult<String> {
        check_component("namespace", &artifacts.namespace)?;
        check_component("package", &artifacts.package_name)?;
        for artifact in &artifacts.artifacts {
            check_component("artifact name", &artifact.name)?;
        }

        let dir = self.package_dir(&artifacts.namespace, &artifacts.package_name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let revision = Self::revision_for(artifacts);
        let current = tokio::fs::read_to_string(dir.join(REVISION_FILE))
            .await
            .unwrap_or_default();
        if current.trim() == revision {
            debug!(package = %artifacts.package_name, revision = %revision, "Package unchanged");
            return Ok(revision);
        }

        let keep: HashSet<&str> = artifacts.artifacts.iter().map(|a| a.name.as_str()).collect();
        for artifact in &artifacts.artifacts {
            let path = dir.join(&artifact.name);
            tokio::fs::write(&path, artifact.content.as_bytes())
                .await
                .map_err(|e| io_error(&path, e))?;
        }

        // Drop files from an older version of the package
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name != REVISION_FILE && !keep.contains(name.as_ref()) {
                let path = entry.path();
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| io_error(&path, e))?;
            }
        }

        let revision_path = dir.join(REVISION_FILE);
        tokio::fs::write(&revision_path, format!("{}\n", revision))
            .await
            .map_err(|e| io_error(&revision_path, e))?;

        info!(
            package = %artifacts.package_name,
            namespace = %artifacts.namespace,
            revision = %revision,
            files = artifacts.artifacts.len(),
            "Package pushed"
        );
        Ok(revision)
    }
}
