//! Volume-System Detectors (§4.5): pluggable back-ends that turn a raw
//! backing path into an ordered sequence of [`VolumeDescriptor`]s.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::dependencies::is_command_available_cached;
use crate::error::Result;
use crate::process::{self, Command};

/// User-selectable volume-detector preference (`-d/--volume-detector`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeDetectorPref {
    Auto,
    LibTsk,
    Mmls,
    Parted,
}

/// The flag a detected region carries; only `Alloc` regions are eligible
/// for mounting (§3 Volume invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFlag {
    Alloc,
    Unalloc,
    Meta,
}

/// One region discovered by a detector, not yet wrapped in the full
/// `Volume` lifecycle type.
#[derive(Debug, Clone)]
pub struct VolumeDescriptor {
    pub offset: u64,
    pub size: u64,
    pub slot: i64,
    pub flag: VolumeFlag,
    pub description: String,
    pub guid: Option<String>,
}

/// Runs the selected detector (or `auto`'s resolution of it) against a raw
/// path, with the multi→single fallback described in §4.5/§4.9: when
/// `single` is `None` (unset), multi-detection runs first and, if it
/// yields zero volumes, `single` detection is retried.
pub async fn detect_volumes(
    raw_path: &Path,
    pref: VolumeDetectorPref,
    vstype_override: Option<&str>,
    single: Option<bool>,
    block_size: u64,
) -> Result<Vec<VolumeDescriptor>> {
    if single == Some(true) {
        return Ok(vec![single_volume(raw_path).await?]);
    }

    let multi = detect_multi(raw_path, pref, vstype_override, block_size).await?;
    if multi.is_empty() && single.is_none() {
        return Ok(vec![single_volume(raw_path).await?]);
    }
    Ok(multi)
}

async fn detect_multi(
    raw_path: &Path,
    pref: VolumeDetectorPref,
    vstype_override: Option<&str>,
    block_size: u64,
) -> Result<Vec<VolumeDescriptor>> {
    match resolve_auto(pref) {
        VolumeDetectorPref::LibTsk => libtsk_detect(raw_path, vstype_override, block_size).await,
        VolumeDetectorPref::Mmls => mmls_detect(raw_path, vstype_override, block_size).await,
        VolumeDetectorPref::Parted => parted_detect(raw_path, block_size).await,
        VolumeDetectorPref::Auto => unreachable!("resolve_auto never returns Auto"),
    }
}

/// `auto` picks the first of {library-binding, mmls, parted} that is
/// actually available. The library binding has no backing implementation
/// in this build (see DESIGN.md), so in practice this resolves to `mmls`
/// when present, else `parted`.
fn resolve_auto(pref: VolumeDetectorPref) -> VolumeDetectorPref {
    match pref {
        VolumeDetectorPref::Auto => {
            if libtsk_available() {
                VolumeDetectorPref::LibTsk
            } else if is_command_available_cached("mmls") {
                VolumeDetectorPref::Mmls
            } else {
                VolumeDetectorPref::Parted
            }
        }
        other => other,
    }
}

fn libtsk_available() -> bool {
    false
}

/// Full no-op detector: kept so the detector protocol is exercised
/// uniformly and a future native-TSK binding can be dropped in without
/// touching `auto` selection (§4.2, §4.5).
async fn libtsk_detect(
    _raw_path: &Path,
    _vstype_override: Option<&str>,
    _block_size: u64,
) -> Result<Vec<VolumeDescriptor>> {
    Err(crate::error::Error::ModuleNotFound("libtsk binding".into()))
}

/// The whole backing is one volume at offset 0; size comes from `file -sL`
/// output, or the directory size when the backing is a directory.
async fn single_volume(raw_path: &Path) -> Result<VolumeDescriptor> {
    let size = if raw_path.is_dir() {
        dir_size(raw_path)
    } else if is_command_available_cached("file") {
        file_size(raw_path).await.unwrap_or_else(|| fs_len(raw_path))
    } else {
        fs_len(raw_path)
    };

    Ok(VolumeDescriptor {
        offset: 0,
        size,
        slot: 0,
        flag: VolumeFlag::Alloc,
        description: String::new(),
        guid: None,
    })
}

fn fs_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn dir_size(path: &Path) -> u64 {
    walkdir_size(path).unwrap_or(0)
}

fn walkdir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += walkdir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

static FILE_SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"size:\s*(\d+)").unwrap());

async fn file_size(path: &Path) -> Option<u64> {
    let out = process::capture(Command::new("file").arg("-sL").arg(path.to_string_lossy().to_string()))
        .await
        .ok()?;
    FILE_SIZE_RE
        .captures(&out)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// `determine_slot(table, slot_within_table) = table*4 + slot_within_table
/// + 1` when `table >= 0`, else `slot + 1` (§4.5 mmls parsing rule).
fn determine_slot(table: i64, slot_within_table: i64) -> i64 {
    if table >= 0 {
        table * 4 + slot_within_table + 1
    } else {
        slot_within_table + 1
    }
}

/// `mmls [-o <offset_in_blocks>] [-t <vstype>] <path>`, with the GPT/DOS
/// retry quirk: when auto-detecting at offset 0 fails with the specific
/// "(GPT or DOS at 0)" ambiguity, retry forcing GPT.
async fn mmls_detect(
    raw_path: &Path,
    vstype_override: Option<&str>,
    block_size: u64,
) -> Result<Vec<VolumeDescriptor>> {
    match run_mmls(raw_path, vstype_override, block_size).await {
        Ok(out) => Ok(parse_mmls(&out, block_size)),
        Err(e) => {
            let msg = e.to_string();
            if vstype_override.is_none() && msg.contains("GPT or DOS at 0") {
                let out = run_mmls(raw_path, Some("gpt"), block_size).await?;
                Ok(parse_mmls(&out, block_size))
            } else {
                Err(e)
            }
        }
    }
}

async fn run_mmls(raw_path: &Path, vstype: Option<&str>, block_size: u64) -> Result<String> {
    let mut cmd = Command::new("mmls");
    if block_size > 0 {
        cmd = cmd.arg("-b").arg(block_size.to_string());
    }
    if let Some(t) = vstype {
        cmd = cmd.arg("-t").arg(t);
    }
    cmd = cmd.arg(raw_path.to_string_lossy().to_string());
    process::capture(cmd).await
}

/// `start`/`len` in mmls output are sector counts; every offset and size
/// fed onward into `mount -o offset=...`, `losetup -o`, and `fsstat -o`
/// addresses bytes, so both are scaled by `block_size` here before a
/// `VolumeDescriptor` is built.
fn parse_mmls(output: &str, block_size: u64) -> Vec<VolumeDescriptor> {
    let mut volumes = Vec::new();
    let mut table = -1i64;
    let mut slot_in_table = 0i64;

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // mmls data rows look like: 000: Meta 0000000000 0000000000 0000000001 Safety Table
        if fields.len() < 5 || !fields[0].ends_with(':') {
            continue;
        }
        let slot_token = fields[1];
        let start: u64 = fields[2].parse().unwrap_or(0);
        let end: u64 = fields[3].parse().unwrap_or(start);
        let len: u64 = fields[4].parse().unwrap_or(end.saturating_sub(start) + 1);
        let description = fields[5..].join(" ");

        let flag = if slot_token.eq_ignore_ascii_case("meta") {
            VolumeFlag::Meta
        } else if slot_token == "-----" {
            VolumeFlag::Unalloc
        } else {
            VolumeFlag::Alloc
        };

        let slot = if let VolumeFlag::Alloc = flag {
            if let Ok(raw_slot) = slot_token.parse::<i64>() {
                let s = determine_slot(table, raw_slot);
                slot_in_table += 1;
                s
            } else {
                slot_in_table += 1;
                slot_in_table
            }
        } else {
            if description.to_lowercase().contains("dos partition table") {
                table += 1;
                slot_in_table = 0;
            }
            -1
        };

        volumes.push(VolumeDescriptor {
            offset: start * block_size,
            size: len * block_size,
            slot,
            flag,
            description,
            guid: None,
        });
    }
    volumes
}

/// parted requires two invocations because its machine-readable mode omits
/// extended-partition metadata (§4.5).
async fn parted_detect(raw_path: &Path, block_size: u64) -> Result<Vec<VolumeDescriptor>> {
    let extended = parted_extended_numbers(raw_path).await;
    let machine = parted_machine_readable(raw_path).await?;
    Ok(parse_parted(&machine, &extended, block_size))
}

async fn parted_extended_numbers(raw_path: &Path) -> Vec<i64> {
    // Never feed parted anything on stdin: it blocks waiting for input on
    // ambiguity, and the process runner always closes stdin when none is
    // supplied (see process::capture).
    let cmd = Command::new("parted").arg(raw_path.to_string_lossy().to_string()).arg("print");
    let out = process::capture(cmd).await.unwrap_or_default();
    out.lines()
        .filter(|l| l.contains("extended"))
        .filter_map(|l| l.split_whitespace().next())
        .filter_map(|n| n.parse::<i64>().ok())
        .collect()
}

async fn parted_machine_readable(raw_path: &Path) -> Result<String> {
    process::capture(
        Command::new("parted")
            .arg(raw_path.to_string_lossy().to_string())
            .arg("-sm")
            .arg("unit")
            .arg("s")
            .arg("print")
            .arg("free"),
    )
    .await
}

/// `start`/`len` in parted's machine-readable output are sector counts
/// (the `s` suffix); [`strip_sector_suffix`] scales them to bytes via
/// `block_size` before a `VolumeDescriptor` is built, matching mmls.
fn parse_parted(output: &str, extended: &[i64], block_size: u64) -> Vec<VolumeDescriptor> {
    let mut volumes = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.trim_end_matches(';').split(':').collect();
        if fields.len() < 5 {
            continue;
        }
        let Ok(slot) = fields[0].parse::<i64>() else {
            continue;
        };
        let start = strip_sector_suffix(fields[1], block_size);
        let len = strip_sector_suffix(fields[3], block_size);
        let description = fields[4].to_string();

        let flag = if description.eq_ignore_ascii_case("free") {
            VolumeFlag::Unalloc
        } else if extended.contains(&slot) {
            VolumeFlag::Meta
        } else {
            VolumeFlag::Alloc
        };

        volumes.push(VolumeDescriptor {
            offset: start,
            size: len,
            slot,
            flag,
            description,
            guid: None,
        });
    }
    volumes
}

fn strip_sector_suffix(field: &str, block_size: u64) -> u64 {
    field.trim_end_matches('s').parse::<u64>().unwrap_or(0) * block_size
}

/// `vshadowinfo -o <offset> <path>`: enumerates VSS shadow stores.
pub async fn vss_detect(raw_path: &Path, offset: u64) -> Result<Vec<VolumeDescriptor>> {
    let out = process::capture(
        Command::new("vshadowinfo")
            .arg("-o")
            .arg(offset.to_string())
            .arg(raw_path.to_string_lossy().to_string()),
    )
    .await?;
    Ok(parse_vshadowinfo(&out))
}

fn parse_vshadowinfo(output: &str) -> Vec<VolumeDescriptor> {
    let mut volumes = Vec::new();
    let mut current_size: Option<u64> = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Store:") {
            if current_size.is_some() {
                volumes.push(make_vss_descriptor(volumes.len() as i64, current_size.take()));
            }
            let _ = rest;
        } else if let Some(rest) = line.strip_prefix("Volume size") {
            let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
            current_size = digits.parse().ok();
        }
    }
    if current_size.is_some() {
        volumes.push(make_vss_descriptor(volumes.len() as i64, current_size.take()));
    }
    volumes
}

fn make_vss_descriptor(index: i64, size: Option<u64>) -> VolumeDescriptor {
    VolumeDescriptor {
        offset: 0,
        size: size.unwrap_or(0),
        slot: index,
        flag: VolumeFlag::Alloc,
        description: "VSS store".to_string(),
        guid: None,
    }
}

/// `lvm lvdisplay <vg>`: each logical volume becomes a subvolume at
/// offset 0.
pub async fn lvm_detect(vg: &str) -> Result<Vec<VolumeDescriptor>> {
    let out = process::capture(Command::new("lvm").arg("lvdisplay").arg(vg)).await?;
    Ok(parse_lvdisplay(&out))
}

fn parse_lvdisplay(output: &str) -> Vec<VolumeDescriptor> {
    let mut volumes = Vec::new();
    let mut in_lv = false;
    let mut name = String::new();
    let mut size = 0u64;
    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("--- Logical volume ---") {
            if in_lv {
                volumes.push(lv_descriptor(&name, size));
            }
            in_lv = true;
            name.clear();
            size = 0;
        } else if let Some(rest) = line.strip_prefix("LV Name") {
            name = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("LV Size") {
            size = parse_lv_size(rest.trim());
        }
    }
    if in_lv {
        volumes.push(lv_descriptor(&name, size));
    }
    volumes
}

fn lv_descriptor(name: &str, size: u64) -> VolumeDescriptor {
    VolumeDescriptor {
        offset: 0,
        size,
        slot: 0,
        flag: VolumeFlag::Alloc,
        description: name.to_string(),
        guid: None,
    }
}

static LV_SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([\d,.]+)\s*([KMGT]iB|B)").unwrap());

/// Parses `"<num> <unit>"` into bytes; units KiB=1024^1 .. TiB=1024^4;
/// commas are accepted as decimal separators.
fn parse_lv_size(text: &str) -> u64 {
    let Some(caps) = LV_SIZE_RE.captures(text) else {
        return 0;
    };
    let number: f64 = caps[1].replace(',', ".").parse().unwrap_or(0.0);
    let multiplier = match &caps[2] {
        "B" => 1u64,
        "KiB" => 1024,
        "MiB" => 1024u64.pow(2),
        "GiB" => 1024u64.pow(3),
        "TiB" => 1024u64.pow(4),
        _ => 1,
    };
    (number * multiplier as f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determine_slot_within_table() {
        assert_eq!(determine_slot(0, 0), 1);
        assert_eq!(determine_slot(1, 2), 7);
        assert_eq!(determine_slot(-1, 3), 4);
    }

    #[test]
    fn parse_mmls_basic() {
        let sample = "\
DOS Partition Table
Offset Sector: 0
Units are in 512-byte sectors

      Slot      Start        End          Length       Description
000:  Meta      0000000000   0000000000   0000000001   Primary Table (#0)
001:  -----     0000000000   0000002047   0000002048   Unallocated
002:  000:000   0000002048   0000206847   0000204800   Win95 FAT32 (0x0c)
";
        let volumes = parse_mmls(sample, 512);
        assert_eq!(volumes.len(), 3);
        assert!(matches!(volumes[0].flag, VolumeFlag::Meta));
        assert!(matches!(volumes[1].flag, VolumeFlag::Unalloc));
        assert!(matches!(volumes[2].flag, VolumeFlag::Alloc));
        assert_eq!(volumes[2].offset, 2048 * 512);
        assert_eq!(volumes[2].size, 204800 * 512);
    }

    #[test]
    fn parse_parted_marks_free_as_unalloc_and_extended_as_meta() {
        let sample = "\
1:0s:2047s:2048s:free;\n\
2:2048s:206847s:204800s:ext4:primary:;\n\
3:206848s:411647s:204800s::extended:;\n";
        let volumes = parse_parted(sample, &[3], 512);
        assert_eq!(volumes.len(), 3);
        assert!(matches!(volumes[0].flag, VolumeFlag::Unalloc));
        assert!(matches!(volumes[1].flag, VolumeFlag::Alloc));
        assert!(matches!(volumes[2].flag, VolumeFlag::Meta));
        assert_eq!(volumes[1].offset, 2048 * 512);
        assert_eq!(volumes[1].size, 204800 * 512);
    }

    #[test]
    fn strip_sector_suffix_scales_by_block_size() {
        assert_eq!(strip_sector_suffix("2048s", 512), 2048 * 512);
    }

    #[test]
    fn parse_lv_size_units() {
        assert_eq!(parse_lv_size("4.00 GiB"), 4 * 1024u64.pow(3));
        assert_eq!(parse_lv_size("512.00 MiB"), 512 * 1024u64.pow(2));
    }

    #[test]
    fn parse_lvdisplay_multiple_volumes() {
        let sample = "\
  --- Logical volume ---
  LV Name                /dev/vg0/root
  LV Size                4.00 GiB

  --- Logical volume ---
  LV Name                /dev/vg0/swap
  LV Size                512.00 MiB
";
        let volumes = parse_lvdisplay(sample);
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].description, "/dev/vg0/root");
        assert_eq!(volumes[1].size, 512 * 1024u64.pow(2));
    }

    #[tokio::test]
    async fn single_volume_uses_file_len_when_file_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.dd");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let desc = single_volume(&path).await.unwrap();
        assert_eq!(desc.offset, 0);
        assert!(matches!(desc.flag, VolumeFlag::Alloc));
    }
}
