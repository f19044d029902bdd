//! Volume and Volume State Machine (§3, §4.8): the recursive node type and
//! its per-node lifecycle (classify, extract stats, mount, detect a
//! last-mountpoint guess, recurse into subvolumes, unmount).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::classifier::{self, FsType};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::filesystem::{self, Key, LuksHandle, LvmHandle, MountContext, RaidStatus};
use crate::mount_helpers;
use crate::process::{self, Command};
use crate::volume_system::{self, VolumeDescriptor, VolumeDetectorPref, VolumeFlag};

/// Free-form metadata gathered from volume-system detection and fsstat
/// (§3 Volume.info).
#[derive(Debug, Clone, Default)]
pub struct VolumeInfo {
    pub fsdescription: String,
    pub guid: Option<String>,
    pub label: Option<String>,
    pub lastmountpoint: Option<String>,
    pub version: Option<String>,
    pub statfstype: Option<String>,
    pub volume_group: Option<String>,
    pub raid_status: Option<RaidStatus>,
    pub creation_time: Option<String>,
    pub parted_flags: Option<String>,
    pub blkid_data: HashMap<String, String>,
    pub magic_data: Option<String>,
}

/// Internal resources acquired during `mount()` that `unmount()` must
/// release in reverse order. Never constructed outside this module.
enum MountState {
    None,
    Generic,
    Loopback(PathBuf),
    Luks(LuksHandle),
    Bde,
    Lvm(LvmHandle),
    Raid(RaidTeardown),
    Vss,
}

/// How a RAID member volume's loopback gets torn down, resolved once at
/// mount time against [`RaidGroup`] dedup (§3/§4.7): the first member to
/// reach a given md device owns the published subvolume and the eventual
/// `mdadm --stop`; every later member just contributes its loopback to
/// the same group and does nothing on its own unmount.
enum RaidTeardown {
    Owner { md_device: PathBuf },
    Member,
    Standalone { loop_dev: PathBuf },
}

/// Loopback devices joined to one active RAID array across sibling member
/// volumes (§3: "Multiple RAID member volumes deduplicate by comparing
/// their md-device target"). Lives on `Disk` so siblings — which are
/// separate top-level `Volume`s, not parent/child — can share it.
#[derive(Debug, Default)]
pub struct RaidGroup {
    pub loop_devs: Vec<PathBuf>,
}

pub struct Volume {
    pub index: String,
    pub offset: u64,
    pub size: u64,
    pub slot: i64,
    pub block_size: u64,
    pub flag: VolumeFlag,
    pub info: VolumeInfo,
    pub key: Option<Key>,
    pub fs_type: Option<FsType>,
    pub volumes: Vec<Volume>,
    pub bindmounts: Vec<PathBuf>,
    pub was_mounted: bool,
    pub is_mounted: bool,
    pub mountpoint: Option<PathBuf>,
    pub exception: Option<String>,

    /// The raw path this volume addresses: its own (set by container
    /// logic), or inherited from the parent/disk otherwise (§3 invariant).
    backing_raw_path: PathBuf,
    own_raw_path: Option<PathBuf>,
    state: MountState,
    volume_detector: VolumeDetectorPref,
}

impl Volume {
    pub fn from_descriptor(
        parent_index: &str,
        local_index: usize,
        descriptor: VolumeDescriptor,
        backing_raw_path: PathBuf,
        volume_detector: VolumeDetectorPref,
    ) -> Self {
        let index = if parent_index.is_empty() {
            local_index.to_string()
        } else {
            format!("{parent_index}.{local_index}")
        };
        Volume {
            index,
            offset: descriptor.offset,
            size: descriptor.size,
            slot: descriptor.slot,
            block_size: 512,
            flag: descriptor.flag,
            info: VolumeInfo {
                fsdescription: descriptor.description,
                guid: descriptor.guid,
                ..Default::default()
            },
            key: None,
            fs_type: None,
            volumes: Vec::new(),
            bindmounts: Vec::new(),
            was_mounted: false,
            is_mounted: false,
            mountpoint: None,
            exception: None,
            backing_raw_path,
            own_raw_path: None,
            state: MountState::None,
            volume_detector,
        }
    }

    pub fn effective_raw_path(&self) -> &Path {
        self.own_raw_path.as_deref().unwrap_or(&self.backing_raw_path)
    }

    fn mount_context<'a>(&'a self, read_write: bool, mountpoint: &'a Path) -> MountContext<'a> {
        MountContext {
            raw_path: self.effective_raw_path(),
            offset: self.offset,
            size: self.size,
            read_write,
            mountpoint,
        }
    }

    /// Eligibility filter (`_should_mount`, §4.8): matches by index,
    /// lastmountpoint, or label against a comma-separated pattern list.
    fn matches_pattern(&self, csv: &str) -> bool {
        csv.split(',').any(|pat| {
            let pat = pat.trim();
            pat == self.index
                || self.info.lastmountpoint.as_deref() == Some(pat)
                || self.info.label.as_deref() == Some(pat)
        })
    }

    fn should_mount(&self, only_mount: Option<&str>, skip_mount: Option<&str>) -> bool {
        let included = only_mount.map(|csv| self.matches_pattern(csv)).unwrap_or(true);
        let excluded = skip_mount.map(|csv| self.matches_pattern(csv)).unwrap_or(false);
        included && !excluded
    }

    /// Runs the full per-volume lifecycle, recursing into any subvolumes a
    /// container mount publishes. Swallows errors onto `self.exception`
    /// when `swallow_exceptions` is set; otherwise propagates.
    pub async fn init(
        &mut self,
        config: &Config,
        only_mount: Option<&str>,
        skip_mount: Option<&str>,
        swallow_exceptions: bool,
        raid_groups: &mut HashMap<PathBuf, RaidGroup>,
    ) -> Result<()> {
        if !self.should_mount(only_mount, skip_mount) {
            return Ok(());
        }
        if !matches!(self.flag, VolumeFlag::Alloc) {
            return Ok(());
        }
        if matches!(self.info.raid_status, Some(RaidStatus::Waiting)) {
            return Ok(());
        }
        if self.is_mounted {
            return Ok(());
        }

        let result = self.init_volume(config, raid_groups).await;
        match result {
            Ok(()) => {}
            Err(e) if swallow_exceptions => {
                warn!(index = %self.index, error = %e, "volume init failed, swallowing");
                self.exception = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        for child in &mut self.volumes {
            Box::pin(child.init(config, only_mount, skip_mount, swallow_exceptions, raid_groups)).await?;
        }
        Ok(())
    }

    async fn init_volume(&mut self, config: &Config, raid_groups: &mut HashMap<PathBuf, RaidGroup>) -> Result<()> {
        self.determine_fs_type(config).await;
        self.load_fsstat_data().await;
        self.mount(config, raid_groups).await?;
        if self.info.lastmountpoint.is_none() {
            self.detect_mountpoint_heuristic();
        }
        Ok(())
    }

    /// Classifier call (§4.6), honoring a configured fstype override for
    /// this index before falling back to evidence-based classification.
    pub async fn determine_fs_type(&mut self, config: &Config) {
        if self.fs_type.is_some() {
            return;
        }
        if let Some(forced) = config.fstypes.resolve(&self.index) {
            if let Some(fs) = fs_type_from_name(forced) {
                self.fs_type = Some(fs);
                return;
            }
        }
        let fallback = config
            .fstypes
            .fallback()
            .and_then(fs_type_from_name);
        let fs = classifier::classify(
            &self.info.fsdescription,
            self.info.guid.as_deref(),
            self.effective_raw_path(),
            self.offset,
            self.size,
            fallback,
        )
        .await;
        self.fs_type = Some(fs);
    }

    /// `fsstat <raw> -o <offset_in_blocks> [-f <fstype>]`, bounded to 3
    /// seconds, parsed for the fields named in §4.8 step 3.
    async fn load_fsstat_data(&mut self) {
        if !process::is_available("fsstat") {
            return;
        }
        let offset_in_blocks = self.offset / self.block_size.max(1);
        let mut cmd = Command::new("fsstat")
            .arg(self.effective_raw_path().to_string_lossy().to_string())
            .arg("-o")
            .arg(offset_in_blocks.to_string());
        if let Some(fs) = self.fs_type {
            if !matches!(fs, FsType::Unknown) {
                cmd = cmd.arg("-f").arg(fs.as_str());
            }
        }
        let output = process::capture_with_timeout(cmd, Duration::from_secs(3))
            .await
            .unwrap_or_default();
        self.parse_fsstat(&output);
    }

    fn parse_fsstat(&mut self, output: &str) {
        static LASTMOUNT_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?i)Last (?:Mount Point|mounted on):\s*(.+)").unwrap());
        static LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Volume Name:\s*(.+)").unwrap());
        static TYPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)File System Type:\s*(.+)").unwrap());
        static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Version:\s*(.+)").unwrap());

        let mut lastmountpoint = None;
        let mut label = None;
        for line in output.lines() {
            if line.contains("CYLINDER GROUP INFORMATION") || line.contains("BLOCK GROUP INFORMATION") {
                break;
            }
            if let Some(c) = LASTMOUNT_RE.captures(line) {
                lastmountpoint = Some(c[1].trim().to_string());
            } else if let Some(c) = LABEL_RE.captures(line) {
                label = Some(c[1].trim().to_string());
            } else if let Some(c) = TYPE_RE.captures(line) {
                self.info.statfstype = Some(c[1].trim().to_string());
            } else if let Some(c) = VERSION_RE.captures(line) {
                self.info.version = Some(c[1].trim().to_string());
            }
        }

        match (lastmountpoint, label) {
            (Some(mount), Some(lab)) => {
                self.info.label = Some(format!("{mount} ({lab})"));
                self.info.lastmountpoint = Some(mount);
            }
            (Some(mount), None) => {
                self.info.label = Some(mount.clone());
                self.info.lastmountpoint = Some(mount);
            }
            (None, Some(lab)) => {
                if let Some(stripped) = lab.strip_prefix('/') {
                    let trimmed = stripped.strip_suffix('1').unwrap_or(stripped);
                    self.info.lastmountpoint = Some(format!("/{trimmed}"));
                }
                self.info.label = Some(lab);
            }
            (None, None) => {}
        }
    }

    /// `detect_mountpoint` heuristic (§4.8 step 5): inspects top-level
    /// entries of a freshly-mounted directory to guess a last mountpoint.
    fn detect_mountpoint_heuristic(&mut self) {
        let Some(mountpoint) = &self.mountpoint else {
            return;
        };
        let entries: Vec<String> = std::fs::read_dir(mountpoint)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default();
        let has = |name: &str| entries.iter().any(|e| e == name);

        let guess = if has("grub") {
            Some("/boot")
        } else if has("usr") || has("var") || has("root") {
            Some("/")
        } else if (has("bin") || has("lib") || has("local") || has("src")) && !has("usr") {
            Some("/usr")
        } else if (has("bin") || has("lib") || has("src")) && !has("local") && !has("usr") {
            Some("/usr/local")
        } else if (has("lib") || has("local") || has("tmp")) && !has("var") {
            Some("/var")
        } else {
            None
        };

        if let Some(guess) = guess {
            self.info.lastmountpoint = Some(guess.to_string());
            self.info.label = Some(guess.to_string());
        }
    }

    /// `filesystem.mount()` (§4.8 step 4): dispatches to the generic
    /// mounter, a dedicated mounter, or container logic, populating
    /// `self.volumes` for container kinds.
    async fn mount(&mut self, config: &Config, raid_groups: &mut HashMap<PathBuf, RaidGroup>) -> Result<()> {
        let fs = self.fs_type.unwrap_or(FsType::Unknown);
        let read_write = config.read_write;

        if matches!(fs, FsType::Swap) {
            return Err(Error::UnsupportedFilesystem("swap".into()));
        }
        if matches!(fs, FsType::VolumeSystem) {
            // Transparent delegate: nothing to mount here, a VolumeSystem
            // detection pass over this volume's own raw path happens in
            // Disk/Parser orchestration instead.
            self.was_mounted = true;
            self.is_mounted = true;
            return Ok(());
        }

        let mountpoint = self.allocate_mountpoint(config)?;

        let result: Result<()> = async {
            if filesystem::uses_generic_mount(fs) {
                filesystem::mount_generic(&self.mount_context(read_write, &mountpoint), fs).await?;
                self.state = MountState::Generic;
            } else {
                match fs {
                    FsType::Jffs2 => {
                        filesystem::mount_jffs2(&self.mount_context(read_write, &mountpoint)).await?;
                        self.state = MountState::Generic;
                    }
                    FsType::Vmfs => {
                        let loop_dev =
                            filesystem::mount_vmfs(&self.mount_context(read_write, &mountpoint)).await?;
                        self.state = MountState::Loopback(loop_dev);
                    }
                    FsType::Luks => {
                        let key = config.keys.resolve(&self.index).and_then(|raw| Key::parse(raw).ok());
                        let handle =
                            filesystem::mount_luks(&self.mount_context(read_write, &mountpoint), key.as_ref())
                                .await?;
                        let child = VolumeDescriptor {
                            offset: 0,
                            size: handle.size,
                            slot: 0,
                            flag: VolumeFlag::Alloc,
                            description: String::new(),
                            guid: None,
                        };
                        let mut v = Volume::from_descriptor(
                            &self.index,
                            0,
                            child,
                            handle.dm_path.clone(),
                            self.volume_detector,
                        );
                        v.own_raw_path = Some(handle.dm_path.clone());
                        self.volumes.push(v);
                        self.state = MountState::Luks(handle);
                    }
                    FsType::Bde => {
                        let key = config.keys.resolve(&self.index).and_then(|raw| Key::parse(raw).ok());
                        filesystem::mount_bde(&self.mount_context(read_write, &mountpoint), key.as_ref())
                            .await?;
                        let child_raw = mountpoint.clone();
                        let child = VolumeDescriptor {
                            offset: 0,
                            size: self.size,
                            slot: 0,
                            flag: VolumeFlag::Alloc,
                            description: String::new(),
                            guid: None,
                        };
                        let mut v = Volume::from_descriptor(&self.index, 0, child, child_raw.clone(), self.volume_detector);
                        v.own_raw_path = Some(child_raw);
                        self.volumes.push(v);
                        self.state = MountState::Bde;
                    }
                    FsType::Lvm => {
                        let handle = filesystem::mount_lvm(&self.mount_context(read_write, &mountpoint)).await?;
                        self.info.volume_group = Some(handle.vg.clone());
                        let children = filesystem::lvm_children(&handle).await.unwrap_or_default();
                        for (i, d) in children.into_iter().enumerate() {
                            self.volumes
                                .push(Volume::from_descriptor(&self.index, i, d, self.effective_raw_path().to_path_buf(), self.volume_detector));
                        }
                        self.state = MountState::Lvm(handle);
                    }
                    FsType::Raid => {
                        let handle = filesystem::mount_raid(&self.mount_context(read_write, &mountpoint)).await?;
                        self.info.raid_status = Some(handle.status);
                        self.state = match (handle.status, handle.md_device.clone()) {
                            (RaidStatus::Active, Some(md)) => {
                                let is_new = !raid_groups.contains_key(&md);
                                raid_groups
                                    .entry(md.clone())
                                    .or_default()
                                    .loop_devs
                                    .push(handle.loop_dev.clone());
                                if is_new {
                                    let child = VolumeDescriptor {
                                        offset: 0,
                                        size: self.size,
                                        slot: 0,
                                        flag: VolumeFlag::Alloc,
                                        description: String::new(),
                                        guid: None,
                                    };
                                    let mut v = Volume::from_descriptor(
                                        &self.index,
                                        0,
                                        child,
                                        md.clone(),
                                        self.volume_detector,
                                    );
                                    v.own_raw_path = Some(md.clone());
                                    self.volumes.push(v);
                                } else {
                                    debug!(index = %self.index, md = %md.display(), "raid member joins an already-published array, reusing its subvolume");
                                }
                                MountState::Raid(if is_new {
                                    RaidTeardown::Owner { md_device: md }
                                } else {
                                    RaidTeardown::Member
                                })
                            }
                            _ => MountState::Raid(RaidTeardown::Standalone { loop_dev: handle.loop_dev.clone() }),
                        };
                    }
                    FsType::Vss => {
                        filesystem::mount_vss(&self.mount_context(read_write, &mountpoint)).await?;
                        let children = filesystem::vss_children(&mountpoint, self.offset).await.unwrap_or_default();
                        for (i, d) in children.into_iter().enumerate() {
                            self.volumes.push(Volume::from_descriptor(&self.index, i, d, mountpoint.clone(), self.volume_detector));
                        }
                        self.state = MountState::Vss;
                    }
                    FsType::Carve => {
                        filesystem::carve(&self.mount_context(read_write, &mountpoint), false).await?;
                        self.state = MountState::Generic;
                    }
                    FsType::Dir => {
                        self.state = MountState::Generic;
                    }
                    _ => return Err(Error::UnsupportedFilesystem(fs.as_str().to_string())),
                }
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.mountpoint = Some(mountpoint);
                self.was_mounted = true;
                self.is_mounted = true;
                Ok(())
            }
            Err(e) => {
                let _ = mount_helpers::remove_mountpoint_with_retry(&mountpoint, 1).await;
                match e {
                    Error::MountpointEmpty(_)
                    | Error::KeyInvalid
                    | Error::IncorrectFilesystem { .. }
                    | Error::UnsupportedFilesystem(_) => Err(e),
                    other => Err(Error::subsystem(fs.as_str(), other)),
                }
            }
        }
    }

    fn allocate_mountpoint(&self, config: &Config) -> Result<PathBuf> {
        let mountdir = config.mountdir_or_temp();
        let label = self
            .info
            .label
            .clone()
            .unwrap_or_else(|| self.index.clone());
        let basename = self.index.replace('.', "_");
        mount_helpers::create_volume_mountpoint(&mountdir, &self.index, &label, config.pretty, &basename)
    }

    /// `unmount(allow_lazy)` (§4.8): children first, then bindmounts, then
    /// this volume's own mounter-specific teardown.
    pub async fn unmount(&mut self, allow_lazy: bool, raid_groups: &mut HashMap<PathBuf, RaidGroup>) -> Result<()> {
        for child in &mut self.volumes {
            Box::pin(child.unmount(allow_lazy, raid_groups)).await?;
        }

        for bindmount in self.bindmounts.drain(..) {
            let _ = mount_helpers::unmount_path(&bindmount, allow_lazy, false).await;
        }

        if !self.is_mounted {
            return Ok(());
        }

        let mountpoint = self.mountpoint.clone();
        match std::mem::replace(&mut self.state, MountState::None) {
            MountState::None => {}
            MountState::Generic => {
                if let Some(mp) = &mountpoint {
                    mount_helpers::unmount_path(mp, allow_lazy, false).await?;
                    mount_helpers::remove_mountpoint_with_retry(mp, mount_helpers::DEFAULT_CLEANUP_TRIES).await?;
                }
            }
            MountState::Loopback(loop_dev) => {
                if let Some(mp) = &mountpoint {
                    filesystem::unmount_vmfs(mp, &loop_dev, allow_lazy).await?;
                    mount_helpers::remove_mountpoint_with_retry(mp, mount_helpers::DEFAULT_CLEANUP_TRIES).await?;
                }
            }
            MountState::Luks(handle) => {
                filesystem::unmount_luks(&handle).await?;
            }
            MountState::Bde => {
                if let Some(mp) = &mountpoint {
                    mount_helpers::unmount_path(mp, allow_lazy, true).await?;
                    mount_helpers::remove_mountpoint_with_retry(mp, mount_helpers::DEFAULT_CLEANUP_TRIES).await?;
                }
            }
            MountState::Lvm(handle) => {
                filesystem::unmount_lvm(&handle).await?;
            }
            MountState::Raid(RaidTeardown::Owner { md_device }) => {
                if let Some(group) = raid_groups.remove(&md_device) {
                    filesystem::unmount_raid(Some(&md_device), &group.loop_devs).await?;
                }
            }
            MountState::Raid(RaidTeardown::Member) => {}
            MountState::Raid(RaidTeardown::Standalone { loop_dev }) => {
                filesystem::unmount_raid(None, std::slice::from_ref(&loop_dev)).await?;
            }
            MountState::Vss => {
                if let Some(mp) = &mountpoint {
                    mount_helpers::unmount_path(mp, allow_lazy, true).await?;
                    mount_helpers::remove_mountpoint_with_retry(mp, mount_helpers::DEFAULT_CLEANUP_TRIES).await?;
                }
            }
        }

        self.is_mounted = false;
        Ok(())
    }

    /// Recursively visits this volume and every descendant.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Volume> + '_> {
        Box::new(std::iter::once(self).chain(self.volumes.iter().flat_map(|v| v.iter())))
    }

    pub fn find_by_index(&self, index: &str) -> Option<&Volume> {
        self.iter().find(|v| v.index == index)
    }

    pub fn find_by_index_mut(&mut self, index: &str) -> Option<&mut Volume> {
        if self.index == index {
            return Some(self);
        }
        self.volumes.iter_mut().find_map(|v| v.find_by_index_mut(index))
    }

    /// Every mountpoint-owning node in this subtree, used by `Parser::clean`
    /// to sort deepest-first (§4.10).
    pub fn mountpoints(&self) -> Vec<&Path> {
        self.iter().filter_map(|v| v.mountpoint.as_deref()).collect()
    }
}

fn fs_type_from_name(name: &str) -> Option<FsType> {
    FsType::all().iter().copied().find(|fs| fs.as_str() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(offset: u64, size: u64, flag: VolumeFlag) -> VolumeDescriptor {
        VolumeDescriptor {
            offset,
            size,
            slot: 0,
            flag,
            description: String::new(),
            guid: None,
        }
    }

    #[test]
    fn index_is_prefixed_by_parent() {
        let v = Volume::from_descriptor(
            "1",
            2,
            descriptor(0, 100, VolumeFlag::Alloc),
            PathBuf::from("/raw"),
            VolumeDetectorPref::Auto,
        );
        assert_eq!(v.index, "1.2");
    }

    #[test]
    fn root_index_has_no_dot() {
        let v = Volume::from_descriptor(
            "",
            0,
            descriptor(0, 100, VolumeFlag::Alloc),
            PathBuf::from("/raw"),
            VolumeDetectorPref::Auto,
        );
        assert_eq!(v.index, "0");
    }

    #[test]
    fn effective_raw_path_prefers_own() {
        let mut v = Volume::from_descriptor(
            "1",
            0,
            descriptor(0, 100, VolumeFlag::Alloc),
            PathBuf::from("/parent"),
            VolumeDetectorPref::Auto,
        );
        assert_eq!(v.effective_raw_path(), Path::new("/parent"));
        v.own_raw_path = Some(PathBuf::from("/own"));
        assert_eq!(v.effective_raw_path(), Path::new("/own"));
    }

    #[test]
    fn should_mount_respects_only_and_skip() {
        let v = Volume::from_descriptor(
            "1",
            0,
            descriptor(0, 100, VolumeFlag::Alloc),
            PathBuf::from("/raw"),
            VolumeDetectorPref::Auto,
        );
        assert!(v.should_mount(None, None));
        assert!(v.should_mount(Some("1.0,2.0"), None));
        assert!(!v.should_mount(Some("2.0"), None));
        assert!(!v.should_mount(None, Some("1.0")));
    }

    #[test]
    fn unalloc_and_meta_are_never_mount_eligible() {
        let mut v = Volume::from_descriptor(
            "1",
            0,
            descriptor(0, 100, VolumeFlag::Unalloc),
            PathBuf::from("/raw"),
            VolumeDetectorPref::Auto,
        );
        assert!(!matches!(v.flag, VolumeFlag::Alloc));
        v.flag = VolumeFlag::Meta;
        assert!(!matches!(v.flag, VolumeFlag::Alloc));
    }

    #[test]
    fn fsstat_both_lastmount_and_label_compose() {
        let mut v = Volume::from_descriptor(
            "1",
            0,
            descriptor(0, 100, VolumeFlag::Alloc),
            PathBuf::from("/raw"),
            VolumeDetectorPref::Auto,
        );
        v.parse_fsstat("Last Mount Point: /home\nVolume Name: mylabel\n");
        assert_eq!(v.info.label.as_deref(), Some("/home (mylabel)"));
        assert_eq!(v.info.lastmountpoint.as_deref(), Some("/home"));
    }

    #[test]
    fn fsstat_label_only_derives_lastmountpoint() {
        let mut v = Volume::from_descriptor(
            "1",
            0,
            descriptor(0, 100, VolumeFlag::Alloc),
            PathBuf::from("/raw"),
            VolumeDetectorPref::Auto,
        );
        v.parse_fsstat("Volume Name: /data1\n");
        assert_eq!(v.info.lastmountpoint.as_deref(), Some("/data"));
    }

    #[test]
    fn fsstat_stops_at_cylinder_group_marker() {
        let mut v = Volume::from_descriptor(
            "1",
            0,
            descriptor(0, 100, VolumeFlag::Alloc),
            PathBuf::from("/raw"),
            VolumeDetectorPref::Auto,
        );
        v.parse_fsstat("Last Mount Point: /home\nCYLINDER GROUP INFORMATION\nVolume Name: ignored\n");
        assert_eq!(v.info.lastmountpoint.as_deref(), Some("/home"));
        assert_eq!(v.info.label.as_deref(), Some("/home"));
    }

    #[test]
    fn fs_type_from_name_roundtrips() {
        assert_eq!(fs_type_from_name("ntfs"), Some(FsType::Ntfs));
        assert_eq!(fs_type_from_name("hfs+"), Some(FsType::HfsPlus));
        assert_eq!(fs_type_from_name("bogus"), None);
    }
}
