//! Reads the operator's node schedule and turns it into pending liveness
//! pings, paced on a ten-minute cadence per identity. The supervisor fans
//! the generated pings out to every live peer connection.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use specterd_primitives::hash::hash256_from_hex;
use specterd_primitives::outpoint::OutPoint;
use specterd_wire::MasternodeBroadcast;

use crate::broadcast_store::BroadcastStore;
use crate::log::{log_debug, log_warn};

/// Cadence of the generation cycle and of each identity's due slots.
pub const CYCLE_SECS: u64 = 10 * 60;

/// One pending liveness ping for an operator-controlled identity. Wire-format
/// flags and version numbers are read from the shared format state at send
/// time, not captured here.
#[derive(Clone, Debug)]
pub struct ScheduledPing {
    pub name: String,
    pub outpoint: OutPoint,
    pub private_key: String,
    pub due_time: u64,
    pub magic_message: String,
    pub broadcast_template: Option<MasternodeBroadcast>,
}

impl ScheduledPing {
    /// Seconds to hold this ping back; zero when the due time already passed.
    pub fn wait_from(&self, now: u64) -> Duration {
        Duration::from_secs(self.due_time.saturating_sub(now))
    }
}

/// Next slot of the identity's ten-minute cadence that lies ahead of `now`.
fn next_due_slot(epoch: i64, now: i64) -> i64 {
    let bump = (now - epoch).div_euclid(CYCLE_SECS as i64) + 1;
    epoch + bump * CYCLE_SECS as i64
}

/// Parses the schedule file. Lines are `name ip privkey collateral_hash
/// collateral_index [epoch]`; `#` comments and blanks are skipped, and a
/// missing epoch is defaulted so freshly added identities stagger out.
pub fn load_schedule(
    path: &Path,
    magic_message: &str,
    templates: &BroadcastStore,
) -> Result<Vec<ScheduledPing>, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let now = unix_now();
    let mut pings = Vec::new();
    let mut defaulted = 0i64;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let default_epoch;
        let mut fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() == 5 {
            log_warn!("no epoch time found for {}, assuming one", fields[0]);
            default_epoch = (now + defaulted * 7 - 540).to_string();
            fields.push(&default_epoch);
            defaulted += 1;
        }
        if fields.len() != 6 {
            log_warn!("skipping malformed schedule line: {line}");
            continue;
        }

        let index: u32 = match fields[4].parse() {
            Ok(index) => index,
            Err(_) => {
                log_warn!("bad collateral index for {}", fields[0]);
                continue;
            }
        };
        let hash = match hash256_from_hex(fields[3]) {
            Ok(hash) => hash,
            Err(err) => {
                log_warn!("bad collateral hash for {}: {err}", fields[0]);
                continue;
            }
        };
        let epoch: i64 = match fields[5].parse() {
            Ok(epoch) => epoch,
            Err(_) => {
                log_warn!("bad epoch for {}", fields[0]);
                continue;
            }
        };

        let outpoint = OutPoint::new(hash, index);
        let broadcast_template = templates.get(&outpoint);
        if broadcast_template.is_some() {
            log_debug!("broadcast template located for {outpoint}");
        }

        pings.push(ScheduledPing {
            name: fields[0].to_string(),
            outpoint,
            private_key: fields[2].to_string(),
            due_time: next_due_slot(epoch, now).max(0) as u64,
            magic_message: magic_message.to_string(),
            broadcast_template,
        });
    }

    pings.sort_by_key(|ping| ping.due_time);
    Ok(pings)
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_secs() as i64)
        .unwrap_or(0)
}
