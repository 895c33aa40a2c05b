//! Cache of the most recent full broadcast per node identity, keyed by the
//! identity's funding reference. Relaying a fresh broadcast alongside each
//! ping keeps a node listed on peers that have restarted since the original
//! announcement.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use specterd_primitives::hash::Hash256;
use specterd_primitives::outpoint::OutPoint;
use specterd_wire::MasternodeBroadcast;

use crate::log::{log_debug, log_info};

const TEMPLATE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Default)]
pub struct BroadcastStore {
    templates: Mutex<HashMap<(Hash256, u32), MasternodeBroadcast>>,
}

impl BroadcastStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores (or replaces) the template for the broadcast's collateral.
    pub fn store(&self, broadcast: MasternodeBroadcast) {
        let outpoint = &broadcast.collateral.previous_outpoint;
        log_debug!("caching broadcast template for {}", outpoint);
        let key = (outpoint.hash, outpoint.index);
        if let Ok(mut templates) = self.templates.lock() {
            templates.insert(key, broadcast);
        }
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<MasternodeBroadcast> {
        self.templates
            .lock()
            .ok()
            .and_then(|templates| templates.get(&(outpoint.hash, outpoint.index)).cloned())
    }

    pub fn len(&self) -> usize {
        self.templates
            .lock()
            .map(|templates| templates.len())
            .unwrap_or(0)
    }

    /// Drops templates whose embedded liveness timestamp is older than a day;
    /// runs on a timer.
    pub fn sweep(&self) {
        let Ok(mut templates) = self.templates.lock() else {
            return;
        };
        let now = SystemTime::now();
        let before = templates.len();
        templates.retain(|_, broadcast| {
            let ping_time = UNIX_EPOCH + Duration::from_secs(broadcast.last_ping.sig_time);
            now.duration_since(ping_time)
                .map(|age| age <= TEMPLATE_MAX_AGE)
                .unwrap_or(true)
        });
        if templates.len() != before {
            log_info!("swept {} expired broadcast templates", before - templates.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BroadcastStore;
    use specterd_primitives::outpoint::OutPoint;
    use specterd_wire::{MasternodeBroadcast, TxIn};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn broadcast_with_ping_age(outpoint: OutPoint, age_hours: u64) -> MasternodeBroadcast {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let mut broadcast = MasternodeBroadcast {
            collateral: TxIn::new(outpoint),
            ..MasternodeBroadcast::default()
        };
        broadcast.last_ping.sig_time = now - age_hours * 3600;
        broadcast
    }

    #[test]
    fn store_and_get_by_collateral() {
        let store = BroadcastStore::new();
        let outpoint = OutPoint::new([0x7e; 32], 1);
        store.store(broadcast_with_ping_age(outpoint.clone(), 0));
        assert!(store.get(&outpoint).is_some());
        assert!(store.get(&OutPoint::new([0x7e; 32], 2)).is_none());
    }

    #[test]
    fn store_overwrites_existing_template() {
        let store = BroadcastStore::new();
        let outpoint = OutPoint::new([0x7e; 32], 1);
        store.store(broadcast_with_ping_age(outpoint.clone(), 2));
        let mut newer = broadcast_with_ping_age(outpoint.clone(), 0);
        newer.protocol_version = 99;
        store.store(newer);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&outpoint).unwrap().protocol_version, 99);
    }

    #[test]
    fn sweep_purges_day_old_templates() {
        let store = BroadcastStore::new();
        let stale = OutPoint::new([0x01; 32], 0);
        let fresh = OutPoint::new([0x02; 32], 0);
        store.store(broadcast_with_ping_age(stale.clone(), 25));
        store.store(broadcast_with_ping_age(fresh.clone(), 23));
        store.sweep();
        assert!(store.get(&stale).is_none());
        assert!(store.get(&fresh).is_some());
    }
}
