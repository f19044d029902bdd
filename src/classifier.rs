//! Filesystem Type Classifier (§4.6): four evidence sources, cumulative
//! scoring across registered filesystem kinds, and early-stop acceptance
//! rules.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::dependencies::is_command_available_cached;
use crate::process::{self, Command};

/// Discriminant for every supported filesystem/container kind (§3
/// FileSystem variants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsType {
    Ext,
    Ufs,
    Ntfs,
    Exfat,
    Xfs,
    Hfs,
    HfsPlus,
    Iso,
    Fat,
    Udf,
    Squashfs,
    Cramfs,
    Minix,
    Jffs2,
    Vmfs,
    Luks,
    Bde,
    Lvm,
    Raid,
    Vss,
    VolumeSystem,
    Unknown,
    Dir,
    Carve,
    Swap,
}

impl FsType {
    pub fn as_str(self) -> &'static str {
        match self {
            FsType::Ext => "ext",
            FsType::Ufs => "ufs",
            FsType::Ntfs => "ntfs",
            FsType::Exfat => "exfat",
            FsType::Xfs => "xfs",
            FsType::Hfs => "hfs",
            FsType::HfsPlus => "hfs+",
            FsType::Iso => "iso",
            FsType::Fat => "fat",
            FsType::Udf => "udf",
            FsType::Squashfs => "squashfs",
            FsType::Cramfs => "cramfs",
            FsType::Minix => "minix",
            FsType::Jffs2 => "jffs2",
            FsType::Vmfs => "vmfs",
            FsType::Luks => "luks",
            FsType::Bde => "bde",
            FsType::Lvm => "lvm",
            FsType::Raid => "raid",
            FsType::Vss => "vss",
            FsType::VolumeSystem => "volumesystem",
            FsType::Unknown => "unknown",
            FsType::Dir => "dir",
            FsType::Carve => "carve",
            FsType::Swap => "swap",
        }
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            FsType::Ext => &["ext2", "ext3", "ext4", "linux"],
            FsType::Ufs => &["4.2bsd", "ufs2", "freebsd"],
            FsType::Ntfs => &["windows ntfs"],
            FsType::Exfat => &["extended fat"],
            FsType::Xfs => &[],
            FsType::Hfs => &["mac os hfs"],
            FsType::HfsPlus => &["mac os extended", "hfsj"],
            FsType::Iso => &["iso9660", "cdfs"],
            FsType::Fat => &["fat12", "fat16", "fat32", "vfat", "dos fat"],
            FsType::Udf => &[],
            FsType::Squashfs => &[],
            FsType::Cramfs => &[],
            FsType::Minix => &[],
            FsType::Jffs2 => &[],
            FsType::Vmfs => &["vmware vmfs"],
            FsType::Luks => &["linux unified key setup"],
            FsType::Bde => &["bitlocker", "bitlocker drive encryption"],
            FsType::Lvm => &["linux lvm", "logical volume manager"],
            FsType::Raid => &["linux raid", "linux software raid"],
            FsType::Vss => &["volume shadow copy", "shadow copy"],
            FsType::VolumeSystem => &["bsd disklabel", "volume system"],
            FsType::Unknown | FsType::Dir | FsType::Carve | FsType::Swap => &[],
        }
    }

    fn guids(self) -> &'static [&'static str] {
        match self {
            FsType::Fat => &["ebd0a0a2-b9e5-4433-87c0-68b6b72699c7"],
            FsType::Ntfs => &["ebd0a0a2-b9e5-4433-87c0-68b6b72699c7"],
            FsType::Ext => &["0fc63daf-8483-4772-8e79-3d69d8477de4"],
            FsType::Luks => &["ca7d7ccb-63ed-4c53-861c-1742536059cc"],
            FsType::Lvm => &["e6d6d379-f507-44c2-a23c-238f2a3df928"],
            FsType::Raid => &["a19d880f-05fc-4d3b-a006-743f0f84911e"],
            FsType::HfsPlus => &["48465300-0000-11aa-aa11-00306543ecac"],
            _ => &[],
        }
    }

    pub fn all() -> &'static [FsType] {
        use FsType::*;
        &[
            Ext, Ufs, Ntfs, Exfat, Xfs, Hfs, HfsPlus, Iso, Fat, Udf, Squashfs, Cramfs, Minix,
            Jffs2, Vmfs, Luks, Bde, Lvm, Raid, Vss, VolumeSystem, Unknown, Dir, Carve, Swap,
        ]
    }

    /// `true` for kinds that don't expose a directory mountpoint but
    /// instead publish child subvolumes (§3 container filesystems).
    pub fn is_container(self) -> bool {
        matches!(
            self,
            FsType::Luks | FsType::Bde | FsType::Lvm | FsType::Raid | FsType::Vss | FsType::VolumeSystem
        )
    }
}

/// One of the four evidence sources consulted in order (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceSource {
    Description,
    Guid,
    Blkid,
    Magic,
}

fn word_present(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let pattern = format!(r"(?i)\b{}\b", regex::escape(needle));
    Regex::new(&pattern).map(|re| re.is_match(haystack)).unwrap_or(false)
}

/// Base scoring rule shared by every variant, before cross-effects are
/// applied.
fn base_score(fs: FsType, source: EvidenceSource, text: &str) -> i32 {
    let mut score = 0;
    if source == EvidenceSource::Guid {
        let lower = text.to_lowercase();
        if fs.guids().iter().any(|g| *g == lower) {
            score += 100;
        }
        return score;
    }
    let lower_text = text.to_lowercase();
    if lower_text == fs.as_str() {
        score += 100;
    } else if word_present(text, fs.as_str()) {
        score += 80;
    } else if fs.aliases().iter().any(|alias| word_present(text, alias)) {
        score += 70;
    }
    score
}

/// Scores every registered variant against one piece of evidence text,
/// then applies the documented cross-effects.
fn score_source(source: EvidenceSource, text: &str) -> HashMap<FsType, i32> {
    let mut scores: HashMap<FsType, i32> = FsType::all()
        .iter()
        .map(|&fs| (fs, base_score(fs, source, text)))
        .collect();

    if source != EvidenceSource::Guid {
        let has_fat = word_present(text, "fat");
        let has_ntfs = word_present(text, "ntfs");
        if has_fat && has_ntfs {
            *scores.entry(FsType::Ntfs).or_default() += 40;
            *scores.entry(FsType::Fat).or_default() -= 50;
            *scores.entry(FsType::Exfat).or_default() -= 50;
        }

        let has_bsd = word_present(text, "bsd");
        let has_42bsd = word_present(text, "4.2bsd");
        let has_ufs_token = word_present(text, "ufs");
        if has_bsd && !has_42bsd && !has_ufs_token {
            *scores.entry(FsType::Ufs).or_default() -= 20;
            *scores.entry(FsType::VolumeSystem).or_default() += 20;
        }

        if text.to_lowercase().contains("dos fat") {
            *scores.entry(FsType::VolumeSystem).or_default() -= 50;
        }

        // hfs vs hfs+ is underspecified when file-magic reports both markers
        // (§9 Open Questions); hfs+ wins as the superset format.
        if word_present(text, "hfs") && (word_present(text, "hfs+") || word_present(text, "hfsj")) {
            *scores.entry(FsType::HfsPlus).or_default() += 10;
        }
    }

    scores
}

/// Merges a newly-scored source into the running accumulator.
fn accumulate(total: &mut HashMap<FsType, i32>, source_scores: HashMap<FsType, i32>) {
    for (fs, score) in source_scores {
        *total.entry(fs).or_default() += score;
    }
}

/// Finds the unique maximum-scoring entry, if any, above `threshold`.
fn unique_leader(scores: &HashMap<FsType, i32>, threshold: i32) -> Option<FsType> {
    let max = scores.values().copied().max()?;
    if max < threshold {
        return None;
    }
    let mut leaders = scores.iter().filter(|(_, &s)| s == max);
    let (fs, _) = leaders.next()?;
    if leaders.next().is_some() {
        None
    } else {
        Some(*fs)
    }
}

/// Parses `blkid -p -O <offset> <raw>` output (`KEY="VALUE"` pairs) into a
/// map, returning a synthetic `TYPE` read from `PTTYPE` only when `TYPE`
/// itself is absent (§4.6 source 3).
fn parse_blkid(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in output.split_whitespace() {
        if let Some((key, value)) = pair.split_once('=') {
            let value = value.trim_matches('"');
            map.insert(key.to_string(), value.to_string());
        }
    }
    if !map.contains_key("TYPE") {
        if let Some(pttype) = map.get("PTTYPE").cloned() {
            map.insert("TYPE".to_string(), pttype);
        }
    }
    map
}

async fn blkid_evidence(raw_path: &Path, offset: u64) -> Option<String> {
    if !is_command_available_cached("blkid") {
        return None;
    }
    let out = process::capture(
        Command::new("blkid")
            .arg("-p")
            .arg("-O")
            .arg(offset.to_string())
            .arg(raw_path.to_string_lossy().to_string()),
    )
    .await
    .ok()?;
    let parsed = parse_blkid(&out);
    parsed.get("TYPE").cloned()
}

/// Reads magic bytes at `offset` (up to `min(size, 4096)` bytes) and feeds
/// them through the installed file-magic binding, falling back to
/// `file -k` through the Process Runner when the native binding isn't
/// built in (§4.2, §4.6).
async fn magic_evidence(raw_path: &Path, offset: u64, size: u64) -> Option<String> {
    let len = size.min(4096);
    #[cfg(feature = "magic-bindings")]
    {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = std::fs::File::open(raw_path).ok()?;
        file.seek(SeekFrom::Start(offset)).ok()?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).ok()?;
        let cookie = magic::Cookie::open(magic::CookieFlags::ERROR).ok()?;
        let cookie = cookie.load(&Default::default()).ok()?;
        return cookie.buffer(&buf).ok();
    }
    #[cfg(not(feature = "magic-bindings"))]
    {
        let _ = len;
        if !is_command_available_cached("file") {
            return None;
        }
        let out = process::capture(
            Command::new("file")
                .arg("-k")
                .arg(raw_path.to_string_lossy().to_string()),
        )
        .await
        .ok()?;
        Some(out)
    }
}

/// Runs the full classifier: accumulates scores from all four sources,
/// with the documented early-stop behavior and fallback resolution.
pub async fn classify(
    description: &str,
    guid: Option<&str>,
    raw_path: &Path,
    offset: u64,
    size: u64,
    fallback: Option<FsType>,
) -> FsType {
    let mut total: HashMap<FsType, i32> = HashMap::new();

    accumulate(&mut total, score_source(EvidenceSource::Description, description));
    if let Some(fs) = unique_leader(&total, 50) {
        return fs;
    }

    if let Some(guid) = guid {
        accumulate(&mut total, score_source(EvidenceSource::Guid, guid));
        if let Some(fs) = unique_leader(&total, 50) {
            return fs;
        }
    }

    if let Some(blkid_type) = blkid_evidence(raw_path, offset).await {
        accumulate(&mut total, score_source(EvidenceSource::Blkid, &blkid_type));
        if let Some(fs) = unique_leader(&total, 50) {
            return fs;
        }
    }

    if let Some(magic) = magic_evidence(raw_path, offset, size).await {
        accumulate(&mut total, score_source(EvidenceSource::Magic, &magic));
        if let Some(fs) = unique_leader(&total, 50) {
            return fs;
        }
    }

    if let Some(fs) = unique_leader(&total, 1) {
        return fs;
    }

    fallback.unwrap_or(FsType::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_description_scores_100() {
        let scores = score_source(EvidenceSource::Description, "ext");
        assert_eq!(scores[&FsType::Ext], 100);
    }

    #[test]
    fn whole_word_in_description_scores_80() {
        let scores = score_source(EvidenceSource::Description, "Linux ext Filesystem");
        assert_eq!(scores[&FsType::Ext], 80);
    }

    #[test]
    fn alias_scores_70() {
        let scores = score_source(EvidenceSource::Description, "FAT32");
        assert_eq!(scores[&FsType::Fat], 70);
    }

    #[test]
    fn ntfs_and_fat_cross_effect() {
        let scores = score_source(EvidenceSource::Description, "NTFS FAT hybrid");
        assert!(scores[&FsType::Ntfs] > 0);
        assert!(scores[&FsType::Fat] < 0);
        assert!(scores[&FsType::Exfat] < 0);
    }

    #[test]
    fn guid_exact_match_scores_100() {
        let scores = score_source(EvidenceSource::Guid, "0FC63DAF-8483-4772-8E79-3D69D8477DE4");
        assert_eq!(scores[&FsType::Ext], 100);
    }

    #[test]
    fn unique_leader_requires_strict_max() {
        let mut scores = HashMap::new();
        scores.insert(FsType::Ext, 80);
        scores.insert(FsType::Fat, 80);
        assert_eq!(unique_leader(&scores, 50), None);
        scores.insert(FsType::Ext, 90);
        assert_eq!(unique_leader(&scores, 50), Some(FsType::Ext));
    }

    #[test]
    fn parse_blkid_falls_back_to_pttype() {
        let out = r#"PTTYPE="dos" USAGE="filesystem""#;
        let map = parse_blkid(out);
        assert_eq!(map.get("TYPE").map(String::as_str), Some("dos"));
    }

    #[test]
    fn parse_blkid_prefers_explicit_type() {
        let out = r#"TYPE="ext4" PTTYPE="dos""#;
        let map = parse_blkid(out);
        assert_eq!(map.get("TYPE").map(String::as_str), Some("ext4"));
    }

    #[tokio::test]
    async fn classify_resolves_from_description_alone() {
        let fs = classify("ext", None, Path::new("/nonexistent"), 0, 0, None).await;
        assert_eq!(fs, FsType::Ext);
    }

    #[tokio::test]
    async fn classify_falls_back_when_nothing_scores() {
        let fs = classify("", None, Path::new("/nonexistent"), 0, 0, Some(FsType::Ext)).await;
        assert_eq!(fs, FsType::Ext);
    }

    #[tokio::test]
    async fn classify_returns_unknown_with_no_evidence_and_no_fallback() {
        let fs = classify("", None, Path::new("/nonexistent"), 0, 0, None).await;
        assert_eq!(fs, FsType::Unknown);
    }
}
