//! Per-shop exclusive sections.
//!
//! One async mutex per shop id, created on first use. Guards are owned so they
//! can move into spawned tasks, and release on drop on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub type ShopGuard = OwnedMutexGuard<()>;

/// Idle slots are pruned once the table grows past this many shops.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct ShopLocks {
    slots: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ShopLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, shop_id: i64) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().await;
        if slots.len() > PRUNE_THRESHOLD {
            // A slot referenced only by the table has no holder and no waiter.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        slots.entry(shop_id).or_default().clone()
    }

    /// Wait for the shop's section.
    pub async fn acquire(&self, shop_id: i64) -> ShopGuard {
        self.slot(shop_id).await.lock_owned().await
    }

    /// Take the shop's section only if nobody holds it.
    pub async fn try_acquire(&self, shop_id: i64) -> Option<ShopGuard> {
        self.slot(shop_id).await.try_lock_owned().ok()
    }
}
