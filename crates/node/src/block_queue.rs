//! Bounded queue of trusted block hashes. A hash reported by peers starts as
//! an orphan and must collect enough independent votes before it is promoted
//! into the queue and used as a liveness anchor.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use specterd_primitives::hash::{hash256_to_hex, Hash256};

use crate::log::{log_debug, log_info};

const QUEUE_CAPACITY: usize = 12;
const PROMOTION_THRESHOLD: u32 = 5;
const ORPHAN_MAX_AGE: Duration = Duration::from_secs(30 * 60);

struct OrphanVotes {
    count: u32,
    last_vote: SystemTime,
}

#[derive(Default)]
struct Inner {
    fifo: VecDeque<Hash256>,
    orphans: HashMap<Hash256, OrphanVotes>,
}

#[derive(Default)]
pub struct BlockQueue {
    inner: Mutex<Inner>,
}

impl BlockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Votes for a hash. The fifth distinct vote promotes it into the queue;
    /// the orphan entry stays behind for the sweeper so late peers do not
    /// recreate it and re-promote.
    pub fn add_hash(&self, hash: Hash256) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.orphans.get_mut(&hash) {
            Some(votes) => {
                votes.count += 1;
                log_debug!("hash {} vote {}", hash256_to_hex(&hash), votes.count);
                match votes.count.cmp(&PROMOTION_THRESHOLD) {
                    std::cmp::Ordering::Equal => {
                        log_debug!("hash over threshold, pushing");
                        push_and_trim(&mut inner, hash);
                    }
                    std::cmp::Ordering::Less => votes.last_vote = SystemTime::now(),
                    std::cmp::Ordering::Greater => {}
                }
            }
            None => {
                log_debug!("new hash tracked: {}", hash256_to_hex(&hash));
                inner.orphans.insert(
                    hash,
                    OrphanVotes {
                        count: 1,
                        last_vote: SystemTime::now(),
                    },
                );
            }
        }
    }

    /// Pushes directly, bypassing the vote gate; used for operator-supplied
    /// or explorer-sourced anchors.
    pub fn force_hash(&self, hash: Hash256) {
        if let Ok(mut inner) = self.inner.lock() {
            push_and_trim(&mut inner, hash);
        }
    }

    /// Most recently promoted hash, the anchor for the next liveness message.
    pub fn get_top(&self) -> Option<Hash256> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.fifo.back().copied())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.fifo.len()).unwrap_or(0)
    }

    /// Drops orphan entries whose last vote is stale; runs on a timer.
    pub fn sweep_orphans(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let now = SystemTime::now();
        let before = inner.orphans.len();
        inner.orphans.retain(|_, votes| {
            now.duration_since(votes.last_vote)
                .map(|age| age <= ORPHAN_MAX_AGE)
                .unwrap_or(true)
        });
        if inner.orphans.len() != before {
            log_info!("swept {} stale orphan hashes", before - inner.orphans.len());
        }
    }

    #[cfg(test)]
    fn backdate_orphan(&self, hash: &Hash256, age: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(votes) = inner.orphans.get_mut(hash) {
            votes.last_vote = SystemTime::now() - age;
        }
    }

    #[cfg(test)]
    fn contains(&self, hash: &Hash256) -> bool {
        self.inner.lock().unwrap().fifo.contains(hash)
    }

    #[cfg(test)]
    fn orphan_count(&self) -> usize {
        self.inner.lock().unwrap().orphans.len()
    }
}

fn push_and_trim(inner: &mut Inner, hash: Hash256) {
    if inner.fifo.contains(&hash) {
        log_debug!("duplicate hash skipped - all is well");
        return;
    }
    inner.fifo.push_back(hash);
    while inner.fifo.len() > QUEUE_CAPACITY {
        inner.fifo.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockQueue, Duration, PROMOTION_THRESHOLD, QUEUE_CAPACITY};
    use specterd_primitives::hash::Hash256;

    fn hash(tag: u8) -> Hash256 {
        let mut out = [0u8; 32];
        out[0] = tag;
        out
    }

    #[test]
    fn empty_queue_has_no_top() {
        let queue = BlockQueue::new();
        assert_eq!(queue.get_top(), None);
    }

    #[test]
    fn top_is_most_recent_push() {
        let queue = BlockQueue::new();
        queue.force_hash(hash(1));
        queue.force_hash(hash(2));
        assert_eq!(queue.get_top(), Some(hash(2)));
    }

    #[test]
    fn promotion_takes_exactly_threshold_votes() {
        let queue = BlockQueue::new();
        for _ in 0..PROMOTION_THRESHOLD - 1 {
            queue.add_hash(hash(7));
            assert_eq!(queue.len(), 0);
        }
        queue.add_hash(hash(7));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get_top(), Some(hash(7)));
        // votes past the threshold neither duplicate nor re-promote
        queue.add_hash(hash(7));
        queue.add_hash(hash(7));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn capacity_holds_under_any_sequence() {
        let queue = BlockQueue::new();
        for tag in 0..40u8 {
            queue.force_hash(hash(tag));
            assert!(queue.len() <= QUEUE_CAPACITY);
        }
        assert_eq!(queue.len(), QUEUE_CAPACITY);
        // oldest trimmed first, newest retained
        assert!(!queue.contains(&hash(0)));
        assert_eq!(queue.get_top(), Some(hash(39)));
    }

    #[test]
    fn duplicate_push_suppressed() {
        let queue = BlockQueue::new();
        queue.force_hash(hash(3));
        queue.force_hash(hash(3));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn sweep_drops_stale_orphans_only() {
        let queue = BlockQueue::new();
        queue.add_hash(hash(1));
        queue.add_hash(hash(2));
        queue.backdate_orphan(&hash(1), Duration::from_secs(31 * 60));
        queue.sweep_orphans();
        assert_eq!(queue.orphan_count(), 1);
    }

    #[test]
    fn promoted_orphan_survives_until_sweep() {
        let queue = BlockQueue::new();
        for _ in 0..PROMOTION_THRESHOLD {
            queue.add_hash(hash(9));
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.orphan_count(), 1);
        queue.backdate_orphan(&hash(9), Duration::from_secs(31 * 60));
        queue.sweep_orphans();
        assert_eq!(queue.orphan_count(), 0);
        // still promoted
        assert_eq!(queue.get_top(), Some(hash(9)));
    }
}
