use super::{RawSlot, Slot, StateStore};
use crate::clock::Millis;
use crate::error::StoreError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Directory-backed store: one file per slot, freshness from mtime.
///
/// Writes go to a uniquely named temp file in the same directory and are
/// renamed over the slot file, so readers see either the old or the new value.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::Directory {
                path: root.display().to_string(),
                source: e,
            })?;

        info!("Shared state store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_path(&self, slot: Slot) -> PathBuf {
        self.root.join(format!("{}.txt", slot.name()))
    }

    async fn write_atomic(&self, slot: Slot, value: &str) -> std::io::Result<()> {
        let target = self.slot_path(slot);
        let temp = self
            .root
            .join(format!(".{}.{}.tmp", slot.name(), uuid::Uuid::new_v4().simple()));

        let result: std::io::Result<()> = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(value.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp, &target).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&temp).await;
        }
        result
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn write(&self, slot: Slot, value: &str) -> Result<(), StoreError> {
        self.write_atomic(slot, value)
            .await
            .map_err(|e| StoreError::Write {
                slot: slot.name().to_string(),
                source: e,
            })?;
        debug!("Wrote slot '{}' = {:?}", slot, value);
        Ok(())
    }

    async fn read_raw(&self, slot: Slot) -> Option<RawSlot> {
        let path = self.slot_path(slot);
        let content = fs::read_to_string(&path).await.ok()?;
        let modified = fs::metadata(&path).await.ok()?.modified().ok()?;
        let modified_at = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Millis)
            .unwrap_or_default();

        Some(RawSlot {
            content,
            modified_at,
        })
    }
}
