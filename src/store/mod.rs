mod file;
mod memory;
mod slots;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;
pub use slots::{
    CameraTelemetry, CaptureResultRecord, FrameStamp, LiveEnabled, SessionStamp, Slot,
    SlotSchema, Stamped, StreamQuality,
};

use crate::clock::Millis;
use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Raw slot content with its modification time
#[derive(Debug, Clone, PartialEq)]
pub struct RawSlot {
    pub content: String,
    pub modified_at: Millis,
}

/// Timestamped flat key/value surface shared by every participant.
///
/// Writes replace the complete value atomically. Reads never fail: a missing
/// or unreadable slot is simply absent.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn write(&self, slot: Slot, value: &str) -> Result<(), StoreError>;

    async fn read_raw(&self, slot: Slot) -> Option<RawSlot>;

    /// Slot content, or `default` when the slot is absent
    async fn read(&self, slot: Slot, default: &str) -> String {
        self.read_raw(slot)
            .await
            .map(|raw| raw.content)
            .unwrap_or_else(|| default.to_string())
    }
}

pub type SharedStore = Arc<dyn StateStore>;

/// Typed access through the slot schemas
#[async_trait]
pub trait StateStoreExt: StateStore {
    async fn load<S: SlotSchema + Send>(&self) -> Option<Stamped<S>> {
        let raw = self.read_raw(S::SLOT).await?;
        match S::parse(&raw.content) {
            Some(value) => Some(Stamped {
                value,
                modified_at: raw.modified_at,
            }),
            None => {
                warn!(
                    "Slot '{}' holds unparsable content {:?}; treating as absent",
                    S::SLOT,
                    raw.content
                );
                None
            }
        }
    }

    async fn load_or<S: SlotSchema + Send>(&self, default: S) -> S {
        self.load::<S>()
            .await
            .map(|stamped| stamped.value)
            .unwrap_or(default)
    }

    async fn save<S: SlotSchema + Sync>(&self, value: &S) -> Result<(), StoreError> {
        self.write(S::SLOT, &value.render()).await
    }
}

impl<T: StateStore + ?Sized> StateStoreExt for T {}
