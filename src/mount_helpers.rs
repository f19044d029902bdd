//! Mountpoint directory and loopback device lifecycle: creation, unique
//! naming per §6's conventions, bounded-retry teardown, and loopback
//! acquisition by querying the host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process::{self, Command};

/// How many 1-second retries a removal loop gets before giving up and
/// surfacing `CleanupError` (§8 boundary behavior).
pub const DEFAULT_CLEANUP_TRIES: u32 = 5;

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Creates the base image directory `<tempdir>/image_mounter_XXXXXX[_<casename>]`.
pub fn create_base_image_dir(casename: Option<&str>) -> Result<PathBuf> {
    let mut name = format!("image_mounter_{}", random_suffix(6));
    if let Some(case) = casename {
        name.push('_');
        name.push_str(case);
    }
    let dir = std::env::temp_dir().join(name);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Creates a volume mountpoint directory, either the random form
/// `<mountdir>/im_<index>_<random>_<label>` or, when `pretty` is set, the
/// human-readable form `<mountdir>/<image_basename>-<label_or_index>`.
pub fn create_volume_mountpoint(
    mountdir: &Path,
    index: &str,
    label: &str,
    pretty: bool,
    image_basename: &str,
) -> Result<PathBuf> {
    std::fs::create_dir_all(mountdir)?;
    let safe_label = sanitize(label);
    let dir_name = if pretty {
        let tail = if safe_label.is_empty() {
            index.to_string()
        } else {
            safe_label
        };
        format!("{image_basename}-{tail}")
    } else {
        format!("im_{}_{}_{}", index, random_suffix(6), safe_label)
    };
    let dir = mountdir.join(dir_name);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Creates the read-write cache file `<tempdir>/image_mounter_rw_cache_XXXXXX`.
pub fn create_rw_cache_path() -> PathBuf {
    std::env::temp_dir().join(format!("image_mounter_rw_cache_{}", random_suffix(6)))
}

/// The LUKS dm-crypt device-mapper name: `image_mounter_luks_<5-digit random>`.
pub fn luks_dm_name() -> String {
    let digits: String = (0..5)
        .map(|_| rand::thread_rng().gen_range(0..10).to_string())
        .collect();
    format!("image_mounter_luks_{digits}")
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Removes an empty directory, retrying up to `tries` times at 1-second
/// intervals (it may still be settling after an async FUSE/umount). Raises
/// `CleanupError` if the directory still exists after the window.
pub async fn remove_mountpoint_with_retry(path: &Path, tries: u32) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    for attempt in 0..tries {
        match std::fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(path = %path.display(), attempt, error = %e, "mountpoint removal retry");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    if path.exists() {
        Err(Error::Cleanup(path.to_path_buf()))
    } else {
        Ok(())
    }
}

/// Finds a free loopback device by querying `losetup -f`.
pub async fn find_free_loopback() -> Result<PathBuf> {
    process::is_available("losetup")
        .then_some(())
        .ok_or_else(|| Error::CommandNotFound("losetup".into()))?;
    let out = process::capture(Command::new("losetup").arg("-f")).await?;
    let dev = out.lines().next().unwrap_or("").trim();
    if dev.is_empty() {
        return Err(Error::NoLoopbackAvailable(
            "losetup -f produced no device".into(),
        ));
    }
    Ok(PathBuf::from(dev))
}

/// Attaches `path` (optionally windowed to `offset`/`size`) to a free
/// loopback device and returns it. Used by VMFS/LUKS/LVM/RAID mounters.
/// Inserts `-r` when `read_write` is false, so a container mounter never
/// acquires a write-capable loopback unless the user explicitly asked for
/// `--read-write`.
pub async fn acquire_loopback(path: &Path, offset: u64, size: Option<u64>, read_write: bool) -> Result<PathBuf> {
    let dev = find_free_loopback().await?;
    let mut cmd = Command::new("losetup").arg("-o").arg(offset.to_string());
    if let Some(size) = size {
        cmd = cmd.arg("--sizelimit").arg(size.to_string());
    }
    if !read_write {
        cmd = cmd.arg("-r");
    }
    cmd = cmd.arg(dev.to_string_lossy().to_string()).arg(path.to_string_lossy().to_string());
    process::run(cmd).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(dev)
}

/// Detaches a loopback device acquired with [`acquire_loopback`].
pub async fn release_loopback(dev: &Path) -> Result<()> {
    let res = process::run(Command::new("losetup").arg("-d").arg(dev.to_string_lossy().to_string())).await;
    if let Err(e) = &res {
        warn!(dev = %dev.display(), error = %e, "failed to release loopback");
    }
    res
}

/// Unmounts `mountpoint`, retrying with the lazy variant when `allow_lazy`
/// is set and the plain form fails. `fuse` selects `fusermount -u`/`-uz`
/// over plain `umount`/`umount -l`.
pub async fn unmount_path(mountpoint: &Path, allow_lazy: bool, fuse: bool) -> Result<()> {
    let plain = if fuse {
        Command::new("fusermount").arg("-u").arg(mountpoint.to_string_lossy().to_string())
    } else {
        Command::new("umount").arg(mountpoint.to_string_lossy().to_string())
    };
    match process::run(plain).await {
        Ok(()) => Ok(()),
        Err(e) if allow_lazy => {
            warn!(mountpoint = %mountpoint.display(), "plain unmount failed, retrying lazily");
            let lazy = if fuse {
                Command::new("fusermount").arg("-uz").arg(mountpoint.to_string_lossy().to_string())
            } else {
                Command::new("umount").arg("-l").arg(mountpoint.to_string_lossy().to_string())
            };
            process::run(lazy).await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_suffix_has_requested_length() {
        assert_eq!(random_suffix(6).len(), 6);
    }

    #[test]
    fn luks_dm_name_has_five_digits() {
        let name = luks_dm_name();
        let digits = name.strip_prefix("image_mounter_luks_").unwrap();
        assert_eq!(digits.len(), 5);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize("My Volume/1"), "My_Volume_1");
    }

    #[tokio::test]
    async fn remove_mountpoint_is_noop_for_missing_path() {
        let res = remove_mountpoint_with_retry(Path::new("/definitely/not/real"), 1).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn create_base_image_dir_includes_casename() {
        let dir = create_base_image_dir(Some("case1")).unwrap();
        assert!(dir.to_string_lossy().contains("case1"));
        assert!(dir.exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn pretty_mountpoint_uses_basename_and_label() {
        let base = std::env::temp_dir().join(format!("im_test_{}", random_suffix(6)));
        let dir = create_volume_mountpoint(&base, "1.1", "My Label", true, "image").unwrap();
        assert!(dir.to_string_lossy().ends_with("image-My_Label"));
        std::fs::remove_dir_all(&base).unwrap();
    }
}
