use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

/// Filesystem backend: keys map to paths under `root`, served back through
/// the storage route.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: &str) -> Self {
        Self {
            root: PathBuf::from(root),
        }
    }

    pub async fn put(&self, key: &str, data: &[u8]) -> Result<String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;

        let url = format!("/api/v1/storage/images/{}", key);
        info!("image stored locally: {}", url);
        Ok(url)
    }
}
