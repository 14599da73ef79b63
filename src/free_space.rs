//! Pre-flight check on local volume capacity.

use std::path::Path;

use log::warn;
use sysinfo::Disks;

use crate::config::ChunkPolicy;

type SpaceProbe = Box<dyn Fn(&Path) -> Option<u64> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheck {
    Ok,
    /// Above the hard floor but getting close; uploads proceed with a warning.
    Low { available: u64 },
    /// Below the hard floor; nothing may start.
    Exhausted { available: u64, required: u64 },
}

/// Guards chunk staging against filling the volume.
///
/// The hard floor assumes one max-size chunk buffer per concurrent unit plus
/// 20% slack. A probe failure allows the upload; refusing to upload because
/// the capacity API is unavailable would strand users.
pub struct FreeSpaceGuard {
    hard_floor: u64,
    probe: SpaceProbe,
}

impl FreeSpaceGuard {
    pub fn new(policy: &ChunkPolicy) -> Self {
        Self::with_probe(policy, Box::new(available_space))
    }

    pub fn with_probe(policy: &ChunkPolicy, probe: SpaceProbe) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(4)
            .max(4);
        let mut hard_floor = parallelism * policy.effective_max_chunk_size();
        hard_floor += hard_floor / 5;
        Self { hard_floor, probe }
    }

    pub fn hard_floor(&self) -> u64 {
        self.hard_floor
    }

    pub fn check(&self, path: &Path) -> SpaceCheck {
        let Some(available) = (self.probe)(path) else {
            warn!("free_space_unavailable: path={}", path.display());
            return SpaceCheck::Ok;
        };

        if available <= self.hard_floor {
            SpaceCheck::Exhausted {
                available,
                required: self.hard_floor,
            }
        } else if available <= self.hard_floor * 2 {
            SpaceCheck::Low { available }
        } else {
            SpaceCheck::Ok
        }
    }
}

/// Free bytes on the volume holding `path`, matched by the longest
/// mount-point prefix.
fn available_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
