use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::core::errors::SandboxError;

/// Per-execution working directory, removed when dropped.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub async fn create(root: &Path) -> Result<Self, SandboxError> {
        let path = root.join(format!("run-{}", Uuid::new_v4()));
        fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_source(&self, file_name: &str, source: &str) -> Result<PathBuf, SandboxError> {
        let source_path = self.path.join(file_name);
        fs::write(&source_path, source).await?;
        Ok(source_path)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            tracing::warn!("Failed to remove {}: {}", self.path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scratch_dir_is_removed_on_drop() {
        let root = std::env::temp_dir().join("codegrader-scratch-test");
        let scratch = ScratchDir::create(&root).await.unwrap();
        let source = scratch.write_source("main.py", "print(1)\n").await.unwrap();

        assert_eq!(std::fs::read_to_string(&source).unwrap(), "print(1)\n");
        let path = scratch.path().to_path_buf();
        drop(scratch);

        assert!(!path.exists());
    }
}
