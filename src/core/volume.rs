use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::sys::statvfs::statvfs;
use nix::unistd::{AccessFlags, access};

/// What the engine needs to know about a destination volume before copying.
pub trait VolumeInfo: Send + Sync {
    fn is_writable(&self, path: &Path) -> bool;

    fn bytes_free(&self, path: &Path) -> io::Result<u64>;
}

/// Queries the mounted filesystems directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemVolumes;

impl VolumeInfo for SystemVolumes {
    fn is_writable(&self, path: &Path) -> bool {
        path.is_dir() && access(path, AccessFlags::W_OK).is_ok()
    }

    fn bytes_free(&self, path: &Path) -> io::Result<u64> {
        let stat = statvfs(path).map_err(io::Error::from)?;
        // Space available to unprivileged users
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}

#[derive(Debug, Clone, Copy)]
struct SimulatedVolume {
    writable: bool,
    free: u64,
}

/// In-memory volumes for tests and dry runs. Unknown paths fall through to
/// the system.
#[derive(Debug, Clone, Default)]
pub struct SimulatedVolumes {
    volumes: Arc<Mutex<HashMap<PathBuf, SimulatedVolume>>>,
}

impl SimulatedVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: impl Into<PathBuf>, writable: bool, free: u64) {
        self.volumes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.into(), SimulatedVolume { writable, free });
    }

    fn get(&self, path: &Path) -> Option<SimulatedVolume> {
        self.volumes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .copied()
    }
}

impl VolumeInfo for SimulatedVolumes {
    fn is_writable(&self, path: &Path) -> bool {
        match self.get(path) {
            Some(volume) => volume.writable,
            None => SystemVolumes.is_writable(path),
        }
    }

    fn bytes_free(&self, path: &Path) -> io::Result<u64> {
        match self.get(path) {
            Some(volume) => Ok(volume.free),
            None => SystemVolumes.bytes_free(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn system_volume_reports_temp_dir() {
        let temp = tempdir().unwrap();
        assert!(SystemVolumes.is_writable(temp.path()));
        assert!(SystemVolumes.bytes_free(temp.path()).unwrap() > 0);
        assert!(!SystemVolumes.is_writable(&temp.path().join("missing")));
        assert!(SystemVolumes.bytes_free(&temp.path().join("missing")).is_err());
    }

    #[test]
    fn simulated_overrides_known_paths() {
        let temp = tempdir().unwrap();
        let volumes = SimulatedVolumes::new();
        volumes.set(temp.path(), false, 10);

        assert!(!volumes.is_writable(temp.path()));
        assert_eq!(volumes.bytes_free(temp.path()).unwrap(), 10);
    }
}
