use super::{RawSlot, Slot, StateStore};
use crate::clock::SharedClock;
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// In-process store stamping writes with an injected clock
#[derive(Clone)]
pub struct MemoryStateStore {
    slots: Arc<Mutex<HashMap<Slot, RawSlot>>>,
    clock: SharedClock,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
}

impl MemoryStateStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            clock,
            fail_writes: Arc::new(AtomicBool::new(false)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make every subsequent write fail, as a full disk would
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Write a value with an explicit modification time
    pub fn insert_at(&self, slot: Slot, value: &str, modified_at: u64) {
        self.slots.lock().insert(
            slot,
            RawSlot {
                content: value.to_string(),
                modified_at,
            },
        );
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn write(&self, slot: Slot, value: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write {
                slot: slot.name().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"),
            });
        }

        self.insert_at(slot, value, self.clock.now_ms());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_raw(&self, slot: Slot) -> Option<RawSlot> {
        self.slots.lock().get(&slot).cloned()
    }
}
