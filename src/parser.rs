//! Parser (§4.10): the top-level aggregate owning every [`Disk`],
//! coordinating bulk init, iteration, reconstruction, and cleanup.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::filesystem;
use crate::path;
use crate::volume::Volume;

pub struct Parser {
    pub config: Config,
    pub disks: Vec<Disk>,
}

impl Parser {
    pub fn new(config: Config) -> Self {
        Parser { config, disks: Vec::new() }
    }

    /// Appends a disk, expanding `path` to its full split-image member
    /// set. Enforces the disk-index invariant: once the first disk has no
    /// index, no second disk may be added.
    pub fn add_disk(&mut self, user_path: &Path, force_index: Option<String>) -> Result<&mut Disk> {
        if self.disks.len() == 1 && self.disks[0].index.is_none() {
            return Err(Error::DiskIndex(
                "cannot add a second disk when the first has no index".into(),
            ));
        }

        let index = force_index.or_else(|| {
            if self.disks.is_empty() {
                None
            } else {
                Some((self.disks.len() + 1).to_string())
            }
        });

        let members = path::expand(user_path);
        let disk = Disk::new(members, index, &self.config);
        self.disks.push(disk);
        Ok(self.disks.last_mut().unwrap())
    }

    /// Mounts every disk's backing, detects its volume system, and
    /// initializes every volume, in insertion order.
    pub async fn init(&mut self, swallow_exceptions: bool) -> Result<()> {
        for disk in &mut self.disks {
            disk.mount(&self.config).await?;
            disk.detect_volumes(&self.config, false).await?;
            disk.init_volumes(&self.config, None, None, swallow_exceptions).await?;
        }
        Ok(())
    }

    /// Same as [`Parser::init`] but with only-mount/skip-mount filters,
    /// used after the disks have already been mounted (§4.10).
    pub async fn init_volumes(
        &mut self,
        only_mount: Option<&str>,
        skip_mount: Option<&str>,
        swallow_exceptions: bool,
    ) -> Result<()> {
        for disk in &mut self.disks {
            disk.detect_volumes(&self.config, false).await?;
            disk.init_volumes(&self.config, only_mount, skip_mount, swallow_exceptions)
                .await?;
        }
        Ok(())
    }

    /// Every volume across every disk, depth-first.
    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.disks.iter().flat_map(|d| d.volumes.iter().flat_map(|v| v.iter()))
    }

    pub fn get_by_index(&self, index: &str) -> Option<&Volume> {
        self.disks
            .iter()
            .flat_map(|d| d.volumes.iter())
            .find_map(|v| v.find_by_index(index))
    }

    pub fn get_by_index_mut(&mut self, index: &str) -> Option<&mut Volume> {
        self.disks
            .iter_mut()
            .flat_map(|d| d.volumes.iter_mut())
            .find_map(|v| v.find_by_index_mut(index))
    }

    /// Unmounts a single volume by index, routed through the owning disk's
    /// RAID dedup registry. Returns `Ok(false)` when no volume has that
    /// index, so callers (the interactive shell) can report "no such
    /// volume" instead of swallowing it as success.
    pub async fn unmount_by_index(&mut self, index: &str, allow_lazy: bool) -> Result<bool> {
        for disk in &mut self.disks {
            for top in &mut disk.volumes {
                if let Some(v) = top.find_by_index_mut(index) {
                    v.unmount(allow_lazy, &mut disk.raid_groups).await?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Unmounts every volume in descending mountpoint order (deepest
    /// first), swallowing per-volume errors; then unmounts every disk in
    /// insertion order without swallowing (§4.10).
    pub async fn clean(&mut self, remove_rw: bool, allow_lazy: bool) -> Result<()> {
        let mut mountpoints: Vec<PathBuf> = self.volumes().filter_map(|v| v.mountpoint.clone()).collect();
        mountpoints.sort();
        mountpoints.reverse();

        for mountpoint in mountpoints {
            for disk in &mut self.disks {
                for top in &mut disk.volumes {
                    if let Some(v) = find_owning(top, &mountpoint) {
                        if let Err(e) = v.unmount(allow_lazy, &mut disk.raid_groups).await {
                            tracing::warn!(mountpoint = %mountpoint.display(), error = %e, "volume unmount failed during clean, continuing");
                        }
                    }
                }
            }
        }

        for disk in &mut self.disks {
            disk.unmount(remove_rw, allow_lazy).await?;
        }
        Ok(())
    }

    /// Bind-mounts every volume with a recorded `lastmountpoint` onto the
    /// root volume's mountpoint tree (§4.10).
    pub async fn reconstruct(&mut self) -> Result<PathBuf> {
        let mut candidates: Vec<(PathBuf, String)> = self
            .volumes()
            .filter_map(|v| {
                let mp = v.mountpoint.clone()?;
                let lmp = v.info.lastmountpoint.clone()?;
                Some((mp, lmp))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let root_pos = candidates.iter().position(|(_, lmp)| lmp == "/");
        let Some(root_pos) = root_pos else {
            return Err(Error::NoRootFound);
        };
        let (root_mountpoint, _) = candidates.remove(root_pos);

        for (mountpoint, lastmountpoint) in candidates {
            if lastmountpoint == "/" {
                continue;
            }
            let dst = join_relative(&root_mountpoint, &lastmountpoint);
            filesystem::bindmount(&mountpoint, &dst).await?;
            if let Some(v) = self.volume_owning_mountpoint_mut(&mountpoint) {
                v.bindmounts.push(dst);
            }
        }

        Ok(root_mountpoint)
    }

    fn volume_owning_mountpoint_mut(&mut self, mountpoint: &Path) -> Option<&mut Volume> {
        for disk in &mut self.disks {
            for top in &mut disk.volumes {
                if let Some(v) = find_owning(top, mountpoint) {
                    return Some(v);
                }
            }
        }
        None
    }
}

fn find_owning<'a>(volume: &'a mut Volume, mountpoint: &Path) -> Option<&'a mut Volume> {
    if volume.mountpoint.as_deref() == Some(mountpoint) {
        return Some(volume);
    }
    volume.volumes.iter_mut().find_map(|v| find_owning(v, mountpoint))
}

fn join_relative(root: &Path, lastmountpoint: &str) -> PathBuf {
    let trimmed = lastmountpoint.trim_start_matches('/');
    if trimmed.is_empty() {
        root.to_path_buf()
    } else {
        root.join(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume_system::{VolumeDescriptor, VolumeDetectorPref, VolumeFlag};

    fn make_volume(mountpoint: &str, lastmountpoint: &str) -> Volume {
        let descriptor = VolumeDescriptor {
            offset: 0,
            size: 100,
            slot: 0,
            flag: VolumeFlag::Alloc,
            description: String::new(),
            guid: None,
        };
        let mut v = Volume::from_descriptor("1", 0, descriptor, PathBuf::from("/raw"), VolumeDetectorPref::Auto);
        v.mountpoint = Some(PathBuf::from(mountpoint));
        v.info.lastmountpoint = Some(lastmountpoint.to_string());
        v
    }

    #[test]
    fn join_relative_strips_leading_slash() {
        assert_eq!(join_relative(Path::new("/tmp/a"), "/etc"), PathBuf::from("/tmp/a/etc"));
    }

    #[test]
    fn join_relative_root_is_root_itself() {
        assert_eq!(join_relative(Path::new("/tmp/a"), "/"), PathBuf::from("/tmp/a"));
    }

    #[tokio::test]
    async fn reconstruct_without_root_errors() {
        let mut parser = Parser::new(Config::default());
        let mut disk = Disk::new(vec![PathBuf::from("/tmp/img.dd")], None, &parser.config);
        disk.volumes.push(make_volume("/tmp/etc", "/etc"));
        disk.volumes.push(make_volume("/tmp/etcx", "/etc/x"));
        parser.disks.push(disk);

        let err = parser.reconstruct().await.unwrap_err();
        assert!(matches!(err, Error::NoRootFound));
    }

    #[test]
    fn find_owning_locates_nested_volume() {
        let mut root = make_volume("/tmp/root", "/");
        root.volumes.push(make_volume("/tmp/etc", "/etc"));
        let found = find_owning(&mut root, Path::new("/tmp/etc"));
        assert!(found.is_some());
    }
}
