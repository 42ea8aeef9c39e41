//! Per-key exclusive operation locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

/// Hands out one async mutex per key so operations on the same key run one
/// at a time while different keys proceed in parallel.
///
/// Entries nobody holds or waits on are pruned on the next acquisition.
#[derive(Default)]
pub struct KeyLocks {
    table: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

pub type KeyGuard = OwnedMutexGuard<()>;

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        let slot = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.retain(|k, m| k == key || Arc::strong_count(m) > 1);
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
