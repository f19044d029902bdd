//! Disk and Disk State Machine (§3, §4.9): a single (possibly multi-file)
//! image, its acquired backing mount, and the top-level volumes detected
//! inside it.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::warn;

use crate::config::Config;
use crate::disk_backing::{self, DiskMounterPref};
use crate::error::Result;
use crate::mount_helpers;
use crate::path::BackingCategory;
use crate::process::{self, Command};
use crate::volume::{RaidGroup, Volume};
use crate::volume_system::{self, VolumeDetectorPref};

pub struct Disk {
    pub paths: Vec<PathBuf>,
    pub index: Option<String>,
    pub backing_category: BackingCategory,
    pub disk_mounter: DiskMounterPref,
    pub volume_detector: VolumeDetectorPref,
    pub mountpoint: Option<PathBuf>,
    pub rwpath: Option<PathBuf>,
    pub nbd_path: Option<PathBuf>,
    pub avfs_path: Option<PathBuf>,
    pub raw_path: Option<PathBuf>,
    pub volumes: Vec<Volume>,
    pub was_mounted: bool,
    pub is_mounted: bool,

    /// md-device dedup across sibling RAID member volumes (§3/§4.7), keyed
    /// by the array device each member joins.
    pub raid_groups: HashMap<PathBuf, RaidGroup>,
}

impl Disk {
    pub fn new(paths: Vec<PathBuf>, index: Option<String>, config: &Config) -> Self {
        let backing_category = BackingCategory::classify(&paths[0]);
        Disk {
            paths,
            index,
            backing_category,
            disk_mounter: config.disk_mounter,
            volume_detector: config.volume_detector,
            mountpoint: None,
            rwpath: None,
            nbd_path: None,
            avfs_path: None,
            raw_path: None,
            volumes: Vec::new(),
            was_mounted: false,
            is_mounted: false,
            raid_groups: HashMap::new(),
        }
    }

    fn label(&self) -> String {
        self.index.clone().unwrap_or_else(|| "0".to_string())
    }

    /// Acquires the backing mount (§4.4), recording the resulting
    /// mountpoint, raw path, and any NBD/avfs derived paths.
    pub async fn mount(&mut self, config: &Config) -> Result<()> {
        let mountpoint = mount_helpers::create_base_image_dir(config.casename.as_deref())?;
        let rw_cache = if config.read_write {
            let cache = mount_helpers::create_rw_cache_path();
            self.rwpath = Some(cache.clone());
            Some(cache)
        } else {
            None
        };

        let mounter_pref = if config.read_write {
            DiskMounterPref::Xmount
        } else {
            self.disk_mounter
        };

        let outcome = disk_backing::mount_backing(
            &self.paths,
            self.backing_category,
            mounter_pref,
            config.read_write,
            rw_cache.as_deref(),
            &mountpoint,
        )
        .await?;

        self.mountpoint = Some(outcome.mountpoint);
        self.raw_path = Some(outcome.raw_path);
        self.nbd_path = outcome.nbd_path;
        self.avfs_path = outcome.avfs_path;
        self.was_mounted = true;
        self.is_mounted = true;
        Ok(())
    }

    /// Runs the volume-system detector with the multi→single fallback
    /// (§4.5/§4.9). Idempotent unless `force` is set.
    pub async fn detect_volumes(&mut self, config: &Config, force: bool) -> Result<()> {
        if !self.volumes.is_empty() && !force {
            return Ok(());
        }
        let raw_path = self.raw_path.clone().ok_or_else(|| {
            crate::error::Error::NotMounted(format!("disk {} has no raw path", self.label()))
        })?;

        let vstype_override = config.vstypes.resolve(&self.label()).map(str::to_string);
        let descriptors = volume_system::detect_volumes(
            &raw_path,
            self.volume_detector,
            vstype_override.as_deref(),
            config.single,
            512,
        )
        .await?;

        self.volumes = descriptors
            .into_iter()
            .enumerate()
            .map(|(i, d)| Volume::from_descriptor("", i, d, raw_path.clone(), self.volume_detector))
            .collect();
        Ok(())
    }

    /// Delegates per-volume init to every top-level volume.
    pub async fn init_volumes(
        &mut self,
        config: &Config,
        only_mount: Option<&str>,
        skip_mount: Option<&str>,
        swallow_exceptions: bool,
    ) -> Result<()> {
        for volume in &mut self.volumes {
            volume
                .init(config, only_mount, skip_mount, swallow_exceptions, &mut self.raid_groups)
                .await?;
        }
        Ok(())
    }

    /// Unmounts every volume in reverse mountpoint order, then detaches
    /// NBD/avfs/backing resources, then removes the rw cache if asked.
    pub async fn unmount(&mut self, remove_rw: bool, allow_lazy: bool) -> Result<()> {
        let mut indices: Vec<usize> = (0..self.volumes.len()).collect();
        indices.sort_by_key(|&i| std::cmp::Reverse(self.volumes[i].mountpoint.clone()));
        for i in indices {
            self.volumes[i].unmount(allow_lazy, &mut self.raid_groups).await?;
        }

        if let Some(nbd) = self.nbd_path.take() {
            process::run(Command::new("qemu-nbd").arg("-d").arg(nbd.to_string_lossy().to_string())).await?;
        }

        if let Some(avfs) = self.avfs_path.take() {
            if let Err(e) = mount_helpers::unmount_path(&avfs, allow_lazy, true).await {
                warn!(path = %avfs.display(), error = %e, "avfs unmount failed");
            }
        }

        if let Some(mountpoint) = self.mountpoint.clone() {
            mount_helpers::unmount_path(&mountpoint, allow_lazy, true).await?;
            mount_helpers::remove_mountpoint_with_retry(&mountpoint, mount_helpers::DEFAULT_CLEANUP_TRIES).await?;
        }

        if remove_rw {
            if let Some(rw) = self.rwpath.take() {
                let _ = std::fs::remove_file(rw);
            }
        }

        self.is_mounted = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_defaults_to_zero_without_index() {
        let disk = Disk::new(vec![PathBuf::from("/tmp/image.dd")], None, &Config::default());
        assert_eq!(disk.label(), "0");
    }

    #[test]
    fn label_uses_assigned_index() {
        let disk = Disk::new(
            vec![PathBuf::from("/tmp/image.dd")],
            Some("2".to_string()),
            &Config::default(),
        );
        assert_eq!(disk.label(), "2");
    }

    #[test]
    fn backing_category_is_classified_from_first_path() {
        let disk = Disk::new(vec![PathBuf::from("/tmp/image.E01")], None, &Config::default());
        assert_eq!(disk.backing_category, BackingCategory::Encase);
    }
}
