//! Autosense: infers wire-format parameters by watching what other peers'
//! liveness messages look like, committing only after enough independent
//! samples agree. Once the result is adopted into [`FormatState`] it is
//! final for the process lifetime.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use specterd_primitives::hash::Hash256;
use specterd_wire::MasternodePing;

use crate::log::log_debug;

#[derive(Default)]
struct Samples {
    seen: HashSet<Hash256>,
    outpoint_forms: Vec<bool>,
    sentinel_versions: Vec<u32>,
    daemon_versions: Vec<u32>,
}

pub struct PingAnalyzer {
    threshold: u32,
    samples: Mutex<Samples>,
}

impl PingAnalyzer {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            samples: Mutex::new(Samples::default()),
        }
    }

    /// Records one observed ping; returns true once enough unique samples
    /// have accumulated to call the vote. Re-relays of a message already
    /// counted are no-ops. Callers adopting the result must stop observing.
    pub fn observe(&self, ping: &MasternodePing) -> bool {
        let Ok(mut samples) = self.samples.lock() else {
            return false;
        };
        if !samples.seen.insert(ping.get_hash()) {
            log_debug!("duplicate ping sample ignored");
            return false;
        }
        samples.outpoint_forms.push(ping.outpoint_form);
        samples.sentinel_versions.push(ping.sentinel_version);
        samples.daemon_versions.push(ping.daemon_version);
        samples.seen.len() as u32 > self.threshold
    }

    /// Majority vote per field. On equal counts the first value to reach the
    /// maximum wins.
    pub fn resolve(&self) -> (bool, u32, u32) {
        let Ok(samples) = self.samples.lock() else {
            return (false, 0, 0);
        };
        (
            mode(&samples.outpoint_forms),
            mode(&samples.sentinel_versions),
            mode(&samples.daemon_versions),
        )
    }

    pub fn sample_count(&self) -> u32 {
        self.samples
            .lock()
            .map(|samples| samples.seen.len() as u32)
            .unwrap_or(0)
    }
}

fn mode<T: Copy + Default + Eq + Hash>(values: &[T]) -> T {
    let mut frequencies: HashMap<T, u32> = HashMap::new();
    let mut highest = 0u32;
    let mut result = T::default();
    for value in values {
        let count = frequencies.entry(*value).or_insert(0);
        *count += 1;
        if *count > highest {
            highest = *count;
            result = *value;
        }
    }
    result
}

/// The wire-format parameters every connection reads at send time. Seeded
/// from configuration; overwritten exactly once when autosense resolves.
pub struct FormatState {
    autosense: AtomicBool,
    outpoint_form: AtomicBool,
    sentinel_version: AtomicU32,
    daemon_version: AtomicU32,
}

impl FormatState {
    pub fn new(autosense: bool, outpoint_form: bool, sentinel_version: u32, daemon_version: u32) -> Self {
        Self {
            autosense: AtomicBool::new(autosense),
            outpoint_form: AtomicBool::new(outpoint_form),
            sentinel_version: AtomicU32::new(sentinel_version),
            daemon_version: AtomicU32::new(daemon_version),
        }
    }

    pub fn autosense(&self) -> bool {
        self.autosense.load(Ordering::Relaxed)
    }

    pub fn outpoint_form(&self) -> bool {
        self.outpoint_form.load(Ordering::Relaxed)
    }

    pub fn sentinel_version(&self) -> u32 {
        self.sentinel_version.load(Ordering::Relaxed)
    }

    pub fn daemon_version(&self) -> u32 {
        self.daemon_version.load(Ordering::Relaxed)
    }

    /// Freezes the voted parameters and ends the autosense phase.
    pub fn adopt(&self, outpoint_form: bool, sentinel_version: u32, daemon_version: u32) {
        self.outpoint_form.store(outpoint_form, Ordering::Relaxed);
        self.sentinel_version.store(sentinel_version, Ordering::Relaxed);
        self.daemon_version.store(daemon_version, Ordering::Relaxed);
        self.autosense.store(false, Ordering::Relaxed);
    }
}
