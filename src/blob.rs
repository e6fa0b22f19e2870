use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Utc;
use uuid::Uuid;

/// Filesystem-backed archive store. Raw HAR bodies live outside the
/// metadata database, keyed as `hars/YYYY-MM-DD/<job_id>.har`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn ensure_container_exists(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("create blob root {}", self.root.display()))
    }

    pub fn key_for(job_id: Uuid) -> String {
        format!("hars/{}/{job_id}.har", Utc::now().format("%Y-%m-%d"))
    }

    pub async fn put(&self, key: &str, archive_text: &str) -> anyhow::Result<()> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create blob dir {}", parent.display()))?;
        }
        tokio::fs::write(&path, archive_text)
            .await
            .with_context(|| format!("write blob {}", path.display()))
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<String> {
        let path = self.resolve(key);
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("read blob {}", path.display()))
    }

    fn resolve(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        // Keys are internally generated; components guard against a stored
        // key escaping the blob root anyway.
        for component in Path::new(key)
            .components()
            .filter_map(|component| match component {
                std::path::Component::Normal(part) => Some(part),
                _ => None,
            })
        {
            path.push(component);
        }
        path
    }
}
