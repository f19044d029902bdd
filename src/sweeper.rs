//! Sweeper (§4.11): pattern-based scanner that reclaims mountpoints,
//! loopbacks, and LVM volume groups left behind by crashed prior runs.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Result;
use crate::process::{self, Command};

pub struct Sweeper {
    pub casename: Option<String>,
    pub pretty: bool,
    pub mountdir: PathBuf,
    /// Broadens `find_mounts()` to also match targets against the
    /// case-specific pattern. Off by default: the pattern is broad enough
    /// to catch unrelated mountpoints, so operators must opt in knowingly
    /// (§9 Open Questions).
    pub greedy: bool,
}

/// One mount-table row, as reported by `mount` with no arguments:
/// `source on target type fstype (options)`.
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub options: String,
}

/// One loop device row, as reported by `losetup -a`:
/// `/dev/loopN: [...]: (backing_file)`.
#[derive(Debug, Clone)]
pub struct LoopEntry {
    pub device: String,
    pub backing_file: String,
}

impl Sweeper {
    pub fn new(casename: Option<String>, pretty: bool, mountdir: Option<PathBuf>, greedy: bool) -> Self {
        Sweeper {
            casename,
            pretty,
            mountdir: mountdir.unwrap_or_else(std::env::temp_dir),
            greedy,
        }
    }

    fn case_pattern(&self) -> Regex {
        let mountdir = regex::escape(&self.mountdir.to_string_lossy());
        let pattern = if self.pretty {
            format!(r"^{mountdir}/.*[0-9.]+-.+$")
        } else {
            format!(r"^{mountdir}/im_[0-9.]+_.+$")
        };
        Regex::new(&pattern).unwrap()
    }

    fn base_pattern(&self) -> Regex {
        let tempdir = regex::escape(&std::env::temp_dir().to_string_lossy());
        let case_suffix = self
            .casename
            .as_ref()
            .map(|c| format!("_{}", regex::escape(c)))
            .unwrap_or_default();
        let pattern = format!(r"^{tempdir}/image_mounter_.*{case_suffix}");
        Regex::new(&pattern).unwrap()
    }

    fn glob_patterns(&self) -> Vec<String> {
        vec![
            format!("{}/im_*", self.mountdir.display()),
            format!("{}/*-*", self.mountdir.display()),
            format!("{}/image_mounter_*", std::env::temp_dir().display()),
        ]
    }

    async fn mount_table(&self) -> Result<Vec<MountEntry>> {
        let out = process::capture(Command::new("mount")).await?;
        Ok(parse_mount_table(&out))
    }

    async fn loop_table(&self) -> Result<Vec<LoopEntry>> {
        let out = process::capture(Command::new("losetup").arg("-a")).await?;
        Ok(parse_loop_table(&out))
    }

    pub async fn find_bindmounts(&self) -> Result<Vec<MountEntry>> {
        let case = self.case_pattern();
        Ok(self
            .mount_table()
            .await?
            .into_iter()
            .filter(|m| m.options.contains("bind") && case.is_match(&m.target))
            .collect())
    }

    pub async fn find_mounts(&self) -> Result<Vec<MountEntry>> {
        let base = self.base_pattern();
        let case = self.case_pattern();
        Ok(self
            .mount_table()
            .await?
            .into_iter()
            .filter(|m| !m.options.contains("bind"))
            .filter(|m| base.is_match(&m.source) || (self.greedy && case.is_match(&m.target)))
            .collect())
    }

    pub async fn find_base_images(&self) -> Result<Vec<MountEntry>> {
        let base = self.base_pattern();
        Ok(self
            .mount_table()
            .await?
            .into_iter()
            .filter(|m| base.is_match(&m.target))
            .collect())
    }

    /// `pvdisplay` grouped into `(vgname, pvname)` pairs, kept only when
    /// the PV's loopback backing file matches the base pattern.
    pub async fn find_volume_groups(&self) -> Result<Vec<(String, String)>> {
        let out = process::capture(Command::new("lvm").arg("pvdisplay")).await?;
        let loops = self.loop_table().await?;
        let base = self.base_pattern();
        Ok(parse_pvdisplay(&out)
            .into_iter()
            .filter(|(_, pv)| {
                loops
                    .iter()
                    .any(|l| &l.device == pv && base.is_match(&l.backing_file))
            })
            .collect())
    }

    pub fn find_clean_dirs(&self) -> Vec<PathBuf> {
        self.glob_patterns()
            .into_iter()
            .flat_map(|pattern| glob::glob(&pattern).into_iter().flatten())
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .collect()
    }

    /// Returns the exact ordered shell commands `unmount()` would run,
    /// without running them (§4.11).
    pub async fn preview_unmount(&self) -> Result<Vec<String>> {
        let mut commands = Vec::new();

        for entry in self.find_bindmounts().await? {
            commands.push(format!("umount {}", entry.target));
        }
        for entry in self.find_mounts().await? {
            commands.push(format!("umount {}", entry.target));
            commands.push(format!("rmdir {}", entry.target));
        }
        for (vg, pv) in self.find_volume_groups().await? {
            commands.push(format!("lvchange -a n {vg}"));
            commands.push(format!("losetup -d {pv}"));
        }
        for entry in self.find_base_images().await? {
            commands.push(format!("fusermount -u {}", entry.target));
            commands.push(format!("rmdir {}", entry.target));
        }
        for dir in self.find_clean_dirs() {
            commands.push(format!("rm -Rf {}", dir.display()));
        }

        Ok(commands)
    }

    /// Runs the same sequence `preview_unmount()` describes, ignoring
    /// individual failures (best-effort, §4.11).
    pub async fn unmount(&self) -> Result<()> {
        for entry in self.find_bindmounts().await? {
            let _ = process::run(Command::new("umount").arg(&entry.target)).await;
        }
        for entry in self.find_mounts().await? {
            let _ = process::run(Command::new("umount").arg(&entry.target)).await;
            let _ = std::fs::remove_dir(&entry.target);
        }
        for (vg, pv) in self.find_volume_groups().await? {
            let _ = process::run(Command::new("lvchange").arg("-a").arg("n").arg(&vg)).await;
            let _ = process::run(Command::new("losetup").arg("-d").arg(&pv)).await;
        }
        for entry in self.find_base_images().await? {
            let _ = process::run(Command::new("fusermount").arg("-u").arg(&entry.target)).await;
            let _ = std::fs::remove_dir(&entry.target);
        }
        for dir in self.find_clean_dirs() {
            let _ = std::fs::remove_dir_all(&dir);
        }
        Ok(())
    }
}

fn parse_mount_table(output: &str) -> Vec<MountEntry> {
    static RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(\S+) on (\S+) type (\S+) \((.*)\)$").unwrap());
    output
        .lines()
        .filter_map(|line| {
            let caps = RE.captures(line.trim())?;
            Some(MountEntry {
                source: caps[1].to_string(),
                target: caps[2].to_string(),
                fstype: caps[3].to_string(),
                options: caps[4].to_string(),
            })
        })
        .collect()
}

fn parse_loop_table(output: &str) -> Vec<LoopEntry> {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\S+):.*\(([^)]+)\)").unwrap());
    output
        .lines()
        .filter_map(|line| {
            let caps = RE.captures(line.trim())?;
            Some(LoopEntry {
                device: caps[1].trim_end_matches(':').to_string(),
                backing_file: caps[2].to_string(),
            })
        })
        .collect()
}

fn parse_pvdisplay(output: &str) -> Vec<(String, String)> {
    let mut result = Vec::new();
    let mut vg = String::new();
    let mut pv = String::new();
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("PV Name") {
            if !pv.is_empty() && !vg.is_empty() {
                result.push((vg.clone(), pv.clone()));
            }
            pv = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("VG Name") {
            vg = rest.trim().to_string();
        }
    }
    if !pv.is_empty() && !vg.is_empty() {
        result.push((vg, pv));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mount_table_basic() {
        let sample = "/dev/loop0 on /tmp/im_1_abcd_label type ext4 (ro,relatime)\n\
                       proc on /proc type proc (rw)\n";
        let entries = parse_mount_table(sample);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].target, "/tmp/im_1_abcd_label");
        assert_eq!(entries[0].fstype, "ext4");
    }

    #[test]
    fn parse_loop_table_basic() {
        let sample = "/dev/loop0: [0041]:123 (/tmp/image_mounter_abcdef/ewf1)\n";
        let entries = parse_loop_table(sample);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].device, "/dev/loop0");
        assert_eq!(entries[0].backing_file, "/tmp/image_mounter_abcdef/ewf1");
    }

    #[test]
    fn parse_pvdisplay_pairs_vg_and_pv() {
        let sample = "\
  --- Physical volume ---
  PV Name               /dev/loop0
  VG Name               vg_forensic
";
        let pairs = parse_pvdisplay(sample);
        assert_eq!(pairs, vec![("vg_forensic".to_string(), "/dev/loop0".to_string())]);
    }

    #[test]
    fn case_pattern_pretty_vs_random() {
        let sweeper = Sweeper::new(None, false, Some(PathBuf::from("/tmp/mnt")), false);
        assert!(sweeper.case_pattern().is_match("/tmp/mnt/im_1.2_abcd_label"));

        let pretty = Sweeper::new(None, true, Some(PathBuf::from("/tmp/mnt")), false);
        assert!(pretty.case_pattern().is_match("/tmp/mnt/image-1.2"));
    }

    #[test]
    fn base_pattern_includes_casename() {
        let sweeper = Sweeper::new(Some("case1".to_string()), false, None, false);
        let tempdir = std::env::temp_dir();
        let path = format!("{}/image_mounter_abcdef_case1", tempdir.display());
        assert!(sweeper.base_pattern().is_match(&path));
    }
}
