//! Filesystem Mounters (§4.7): one mount/unmount strategy per supported
//! filesystem or container kind. Simple filesystems share a generic
//! `mount(8)` invocation; containers (LUKS/BDE/LVM/RAID/VSS) attach a
//! loop/dm/md node and publish child [`VolumeDescriptor`]s instead of a
//! directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::classifier::FsType;
use crate::error::{Error, Result};
use crate::mount_helpers::{self, luks_dm_name};
use crate::process::{self, Command};
use crate::volume_system::{self, VolumeDescriptor};

/// Key material as described in §3: `<scheme>:<value>`, one printable
/// character scheme, commas disallowed in the value.
#[derive(Debug, Clone)]
pub struct Key {
    pub scheme: char,
    pub value: String,
}

impl Key {
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme_str, value) = raw
            .split_once(':')
            .ok_or_else(|| Error::Argument(format!("key material must be `<scheme>:<value>`: {raw}")))?;
        if value.contains(',') {
            return Err(Error::Argument(
                "key material value may not contain commas".into(),
            ));
        }
        let mut chars = scheme_str.chars();
        let scheme = chars
            .next()
            .ok_or_else(|| Error::Argument("key material scheme is empty".into()))?;
        if chars.next().is_some() {
            return Err(Error::Argument(
                "key material scheme must be a single character".into(),
            ));
        }
        Ok(Key { scheme, value: value.to_string() })
    }
}

/// Parameters every mounter needs, gathered from the owning `Volume`.
pub struct MountContext<'a> {
    pub raw_path: &'a Path,
    pub offset: u64,
    pub size: u64,
    pub read_write: bool,
    pub mountpoint: &'a Path,
}

/// `(mount_opts, mount_type_token)` for the generic `mount(8)` path
/// (§4.7 table). Types not listed use their own name for both.
fn simple_mount_profile(fs: FsType) -> (&'static str, &'static str) {
    match fs {
        FsType::Ext => ("noexec,noload", "ext4"),
        FsType::Ufs => ("ufstype=ufs2", "ufs"),
        FsType::Ntfs => ("show_sys_files,noexec,force,streams_interface=windows", "ntfs"),
        FsType::Exfat => ("noexec,force", "exfat"),
        FsType::Xfs => ("norecovery", "xfs"),
        FsType::HfsPlus => ("force", "hfsplus"),
        FsType::Iso => ("", "iso9660"),
        FsType::Fat => ("", "vfat"),
        other => ("", other.as_str()),
    }
}

/// `true` for kinds handled by the generic loop-mount path rather than a
/// dedicated mounter below.
pub fn uses_generic_mount(fs: FsType) -> bool {
    matches!(
        fs,
        FsType::Ext
            | FsType::Ufs
            | FsType::Ntfs
            | FsType::Exfat
            | FsType::Xfs
            | FsType::Hfs
            | FsType::HfsPlus
            | FsType::Iso
            | FsType::Fat
            | FsType::Udf
            | FsType::Squashfs
            | FsType::Cramfs
            | FsType::Minix
            | FsType::Unknown
    )
}

/// `mount <raw> <mountpoint> -o loop,offset=<off>,sizelimit=<size>[,ro][,opts] [-t <type>]`.
/// `Unknown` omits `-t` entirely, matching a real mount attempt without a
/// forced type.
pub async fn mount_generic(ctx: &MountContext<'_>, fs: FsType) -> Result<()> {
    let (opts, mount_type) = simple_mount_profile(fs);
    let mut option_str = format!("loop,offset={},sizelimit={}", ctx.offset, ctx.size);
    if !ctx.read_write {
        option_str.push_str(",ro");
    }
    if !opts.is_empty() {
        option_str.push(',');
        option_str.push_str(opts);
    }

    let mut cmd = Command::new("mount")
        .arg(ctx.raw_path.to_string_lossy().to_string())
        .arg(ctx.mountpoint.to_string_lossy().to_string())
        .arg("-o")
        .arg(option_str);
    if !matches!(fs, FsType::Unknown) {
        cmd = cmd.arg("-t").arg(mount_type);
    }
    process::run(cmd).await
}

/// JFFS2: `mtdram`/`mtdblock` backed, single-writer — see §4.7 caveat.
pub async fn mount_jffs2(ctx: &MountContext<'_>) -> Result<()> {
    let size_in_kb = ((ctx.size as f64 * 1.2) / 1024.0).ceil() as u64;
    process::run(Command::new("modprobe").arg("mtd")).await?;
    process::run(Command::new("modprobe").arg("jffs2")).await?;
    process::run(
        Command::new("modprobe")
            .arg("mtdram")
            .arg(format!("total_size={size_in_kb}"))
            .arg("erase_size=256"),
    )
    .await?;
    process::run(Command::new("modprobe").arg("mtdblock")).await?;
    process::run(
        Command::new("dd")
            .arg(format!("if={}", ctx.raw_path.display()))
            .arg("of=/dev/mtd0"),
    )
    .await?;
    process::run(
        Command::new("mount")
            .arg("/dev/mtdblock0")
            .arg(ctx.mountpoint.to_string_lossy().to_string())
            .arg("-t")
            .arg("jffs2"),
    )
    .await
}

/// VMFS: acquire a loopback over (offset, size), then `vmfs-fuse`.
pub async fn mount_vmfs(ctx: &MountContext<'_>) -> Result<PathBuf> {
    let loop_dev =
        mount_helpers::acquire_loopback(ctx.raw_path, ctx.offset, Some(ctx.size), ctx.read_write).await?;
    let res = process::run(
        Command::new("vmfs-fuse")
            .arg(loop_dev.to_string_lossy().to_string())
            .arg(ctx.mountpoint.to_string_lossy().to_string()),
    )
    .await;
    if res.is_err() {
        let _ = mount_helpers::release_loopback(&loop_dev).await;
        res?;
    }
    Ok(loop_dev)
}

pub async fn unmount_vmfs(mountpoint: &Path, loop_dev: &Path, allow_lazy: bool) -> Result<()> {
    mount_helpers::unmount_path(mountpoint, allow_lazy, false).await?;
    mount_helpers::release_loopback(loop_dev).await
}

/// Result of successfully opening a LUKS container: the dm-crypt node to
/// address, the dm name to close it with, the loopback it rides on, and
/// the decrypted sector count reported by `cryptsetup status`.
pub struct LuksHandle {
    pub dm_path: PathBuf,
    pub dm_name: String,
    pub loop_dev: PathBuf,
    pub size: u64,
}

static CRYPTSETUP_SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s+sectors").unwrap());

/// `cryptsetup isLuks` probe, then `luksOpen` with the key material from
/// §3's three LUKS schemes (p/f/m), then a `status` query to recover the
/// decrypted size.
pub async fn mount_luks(ctx: &MountContext<'_>, key: Option<&Key>) -> Result<LuksHandle> {
    let loop_dev =
        mount_helpers::acquire_loopback(ctx.raw_path, ctx.offset, Some(ctx.size), ctx.read_write).await?;

    if process::run(Command::new("cryptsetup").arg("isLuks").arg(loop_dev.to_string_lossy().to_string()))
        .await
        .is_err()
    {
        let _ = mount_helpers::release_loopback(&loop_dev).await;
        return Err(Error::IncorrectFilesystem { expected: "luks".into() });
    }

    let dm_name = luks_dm_name();
    let mut cmd = Command::new("cryptsetup");
    if !ctx.read_write {
        cmd = cmd.arg("-r");
    }
    cmd = cmd.arg("luksOpen").arg(loop_dev.to_string_lossy().to_string()).arg(&dm_name);

    let had_password;
    match key.map(|k| k.scheme) {
        Some('p') => {
            had_password = true;
            let value = key.unwrap().value.clone();
            cmd = cmd.stdin_bytes(value.into_bytes());
        }
        Some('f') => {
            had_password = true;
            cmd = cmd.arg("--key-file").arg(&key.unwrap().value);
        }
        Some('m') => {
            had_password = true;
            cmd = cmd.arg("--master-key-file").arg(&key.unwrap().value);
        }
        _ => had_password = false,
    }

    if let Err(e) = process::run(cmd).await {
        let _ = mount_helpers::release_loopback(&loop_dev).await;
        return if had_password {
            Err(Error::KeyInvalid)
        } else {
            Err(e)
        };
    }

    let status = process::capture(Command::new("cryptsetup").arg("status").arg(&dm_name))
        .await
        .unwrap_or_default();
    let size = CRYPTSETUP_SIZE_RE
        .captures(&status)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map(|sectors| sectors * 512)
        .unwrap_or(0);

    Ok(LuksHandle {
        dm_path: PathBuf::from(format!("/dev/mapper/{dm_name}")),
        dm_name,
        loop_dev,
        size,
    })
}

pub async fn unmount_luks(handle: &LuksHandle) -> Result<()> {
    process::run(Command::new("cryptsetup").arg("luksClose").arg(&handle.dm_name)).await?;
    mount_helpers::release_loopback(&handle.loop_dev).await
}

/// BDE: no loopback, direct `bdemount`; publishes a single child volume
/// whose raw path lives inside the produced mountpoint.
pub async fn mount_bde(ctx: &MountContext<'_>, key: Option<&Key>) -> Result<()> {
    let mut cmd = Command::new("bdemount")
        .arg(ctx.raw_path.to_string_lossy().to_string())
        .arg(ctx.mountpoint.to_string_lossy().to_string())
        .arg("-o")
        .arg(ctx.offset.to_string());
    if let Some(key) = key {
        if matches!(key.scheme, 'k' | 'p' | 'r' | 's') {
            cmd = cmd.arg(format!("-{}", key.scheme)).arg(&key.value);
        }
    }
    process::run(cmd).await
}

/// Result of attaching an LVM physical volume: the volume group name (for
/// deactivation) and the loopback it rides on.
pub struct LvmHandle {
    pub vg: String,
    pub loop_dev: PathBuf,
}

static PVSCAN_VG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"VG (\S+)").unwrap());

/// Suppresses the host's LVM fd-count warning for every LVM invocation,
/// per §6's documented environment variable.
fn lvm_env(mut cmd: Command) -> Command {
    cmd = cmd.env("LVM_SUPPRESS_FD_WARNINGS", "1");
    cmd
}

pub async fn mount_lvm(ctx: &MountContext<'_>) -> Result<LvmHandle> {
    let loop_dev =
        mount_helpers::acquire_loopback(ctx.raw_path, ctx.offset, Some(ctx.size), ctx.read_write).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let pvscan = process::capture(lvm_env(Command::new("lvm").arg("pvscan"))).await?;
    let vg = PVSCAN_VG_RE
        .captures(&pvscan)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| Error::subsystem("lvm pvscan", "could not determine volume group name"))?;

    process::run(lvm_env(Command::new("lvm").arg("vgchange").arg("-a").arg("y").arg(&vg))).await?;

    Ok(LvmHandle { vg, loop_dev })
}

pub async fn unmount_lvm(handle: &LvmHandle) -> Result<()> {
    process::run(lvm_env(Command::new("lvm").arg("vgchange").arg("-a").arg("n").arg(&handle.vg))).await?;
    mount_helpers::release_loopback(&handle.loop_dev).await
}

pub async fn lvm_children(handle: &LvmHandle) -> Result<Vec<VolumeDescriptor>> {
    volume_system::lvm_detect(&handle.vg).await
}

/// RAID member outcome, distinguished by `mdadm -IR` output substrings
/// (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidStatus {
    Active,
    Waiting,
}

pub struct RaidHandle {
    pub md_device: Option<PathBuf>,
    pub loop_dev: PathBuf,
    pub status: RaidStatus,
}

static MDADM_ATTACHED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"attached to (\S+)").unwrap());

pub async fn mount_raid(ctx: &MountContext<'_>) -> Result<RaidHandle> {
    let loop_dev =
        mount_helpers::acquire_loopback(ctx.raw_path, ctx.offset, Some(ctx.size), ctx.read_write).await?;
    let out = process::capture(Command::new("mdadm").arg("-IR").arg(loop_dev.to_string_lossy().to_string())).await?;

    let md_device = MDADM_ATTACHED_RE
        .captures(&out)
        .and_then(|c| c.get(1))
        .map(|m| PathBuf::from(m.as_str()));

    let status = if out.contains("already active") {
        RaidStatus::Active
    } else if out.contains("not enough to start") {
        RaidStatus::Waiting
    } else {
        RaidStatus::Active
    };

    Ok(RaidHandle { md_device, loop_dev, status })
}

/// Tears down a whole RAID array: unmounts every sibling member sharing
/// `md_device` (by releasing each of their loopbacks) before stopping the
/// array itself, then releases the loop the array's own representative
/// volume held (§3/§4.7). `md_device` is `None` for a member that never
/// joined an active array (`RaidStatus::Waiting`), in which case only its
/// own loopback is released.
pub async fn unmount_raid(md_device: Option<&Path>, loop_devs: &[PathBuf]) -> Result<()> {
    if let Some(md) = md_device {
        process::run(Command::new("mdadm").arg("--stop").arg(md.to_string_lossy().to_string())).await?;
    }
    for loop_dev in loop_devs {
        mount_helpers::release_loopback(loop_dev).await?;
    }
    Ok(())
}

/// Volume-shadow: `vshadowmount` exposes every shadow store as a file
/// inside its own mountpoint, which is then re-detected by the VSS
/// volume-system detector.
pub async fn mount_vss(ctx: &MountContext<'_>) -> Result<()> {
    process::run(
        Command::new("vshadowmount")
            .arg("-o")
            .arg(ctx.offset.to_string())
            .arg(ctx.raw_path.to_string_lossy().to_string())
            .arg(ctx.mountpoint.to_string_lossy().to_string()),
    )
    .await
}

pub async fn vss_children(mountpoint: &Path, offset: u64) -> Result<Vec<VolumeDescriptor>> {
    volume_system::vss_detect(mountpoint, offset).await
}

/// Carving pseudo-filesystem: `photorec` runs into a temporary output
/// directory that becomes the published mountpoint.
pub async fn carve(ctx: &MountContext<'_>, freespace: bool) -> Result<()> {
    std::fs::create_dir_all(ctx.mountpoint)?;
    let mut cmd = Command::new("photorec").arg("/d").arg(ctx.mountpoint.to_string_lossy().to_string());
    if freespace {
        cmd = cmd.arg(ctx.raw_path.to_string_lossy().to_string());
    } else {
        cmd = cmd
            .arg("/cmd")
            .arg(ctx.raw_path.to_string_lossy().to_string())
            .arg("partition_none,fileopt,everything,enable,search");
    }
    process::run(cmd).await
}

/// Reconstruction bind-mount: `mount --bind <src> <dst>`.
pub async fn bindmount(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    process::run(
        Command::new("mount")
            .arg("--bind")
            .arg(src.to_string_lossy().to_string())
            .arg(dst.to_string_lossy().to_string()),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parses_scheme_and_value() {
        let key = Key::parse("p:hunter2").unwrap();
        assert_eq!(key.scheme, 'p');
        assert_eq!(key.value, "hunter2");
    }

    #[test]
    fn key_rejects_comma_in_value() {
        assert!(Key::parse("f:/path,with,commas").is_err());
    }

    #[test]
    fn key_rejects_missing_scheme() {
        assert!(Key::parse("novalue").is_err());
    }

    #[test]
    fn simple_mount_profile_matches_table() {
        assert_eq!(simple_mount_profile(FsType::Ext), ("noexec,noload", "ext4"));
        assert_eq!(simple_mount_profile(FsType::Iso), ("", "iso9660"));
        assert_eq!(simple_mount_profile(FsType::Fat), ("", "vfat"));
    }

    #[test]
    fn cryptsetup_status_size_parses_sectors() {
        let sample = "  device:  /dev/mapper/image_mounter_luks_12345\n  size: 204800 sectors\n";
        let caps = CRYPTSETUP_SIZE_RE.captures(sample).unwrap();
        assert_eq!(&caps[1], "204800");
    }

    #[test]
    fn mdadm_attached_device_is_parsed() {
        let out = "mdadm: /dev/loop0 attached to /dev/md127 which is already active.\n";
        let caps = MDADM_ATTACHED_RE.captures(out).unwrap();
        assert_eq!(&caps[1], "/dev/md127");
    }

    #[test]
    fn raid_status_waiting_detected() {
        let out = "mdadm: /dev/loop0 attached to /dev/md126, not enough to start the array.\n";
        let status = if out.contains("already active") {
            RaidStatus::Active
        } else if out.contains("not enough to start") {
            RaidStatus::Waiting
        } else {
            RaidStatus::Active
        };
        assert_eq!(status, RaidStatus::Waiting);
    }
}
