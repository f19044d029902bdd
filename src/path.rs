//! Recognizes split-image naming conventions and expands a single
//! user-supplied path to the full ordered set of member files, then
//! classifies the result into a [`BackingCategory`].

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

static ENCASE_TAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^.*\.e[x]?\d\d$").unwrap());
static NUMERIC_TAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^.*\.\d{2,3}$").unwrap());

/// The category a backing image belongs to, which drives the preferred
/// order of disk-mounter candidates (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingCategory {
    Encase,
    Vmdk,
    Qcow2,
    Compressed,
    Dd,
}

impl BackingCategory {
    pub fn classify(path: &Path) -> Self {
        let name = path.to_string_lossy().to_lowercase();
        if ENCASE_TAIL.is_match(&name) {
            BackingCategory::Encase
        } else if name.ends_with(".vmdk") {
            BackingCategory::Vmdk
        } else if name.ends_with(".qcow2") {
            BackingCategory::Qcow2
        } else if name.ends_with(".zip")
            || name.ends_with(".rar")
            || name.ends_with(".tar.gz")
            || name.ends_with(".tgz")
            || name.ends_with(".gz")
        {
            BackingCategory::Compressed
        } else {
            BackingCategory::Dd
        }
    }
}

/// Expands `path` to the ordered set of member files making up a (possibly
/// split) image, per the three rules in §4.3. Expansion never touches the
/// filesystem for the non-split case; for split cases it globs and sorts
/// lexicographically so the member order is deterministic.
pub fn expand(path: &Path) -> Vec<PathBuf> {
    let tail = path.to_string_lossy().to_string();
    let pattern = if ENCASE_TAIL.is_match(&tail.to_lowercase()) {
        Some(encase_glob(path))
    } else if NUMERIC_TAIL.is_match(&tail) {
        Some(numeric_glob(path))
    } else {
        None
    };

    let Some(pattern) = pattern else {
        return vec![path.to_path_buf()];
    };

    let mut members: Vec<PathBuf> = glob::glob(&pattern)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .collect();
    members.sort();

    if members.is_empty() {
        vec![path.to_path_buf()]
    } else {
        members
    }
}

/// `<stem>.Exx` / `<stem>.Exxx` expands to `<stem>??` (the extension's
/// digits become wildcards, since the letter before them may be upper or
/// lower and the member count is unknown up front).
fn encase_glob(path: &Path) -> String {
    let s = path.to_string_lossy();
    let stem_len = s.len().saturating_sub(2);
    format!("{}??", &s[..stem_len])
}

/// `<stem>.NNN` expands to `<stem>.[0-9][0-9]?` (two or three digit
/// numeric suffixes).
fn numeric_glob(path: &Path) -> String {
    let s = path.to_string_lossy();
    let dot = s.rfind('.').unwrap_or(s.len());
    format!("{}.[0-9][0-9]?", &s[..dot])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_encase() {
        assert_eq!(
            BackingCategory::classify(Path::new("image.E01")),
            BackingCategory::Encase
        );
    }

    #[test]
    fn classify_vmdk() {
        assert_eq!(
            BackingCategory::classify(Path::new("image.vmdk")),
            BackingCategory::Vmdk
        );
    }

    #[test]
    fn classify_qcow2() {
        assert_eq!(
            BackingCategory::classify(Path::new("image.qcow2")),
            BackingCategory::Qcow2
        );
    }

    #[test]
    fn classify_compressed_variants() {
        for ext in ["zip", "rar", "tgz", "gz"] {
            let p = PathBuf::from(format!("image.{ext}"));
            assert_eq!(BackingCategory::classify(&p), BackingCategory::Compressed);
        }
    }

    #[test]
    fn classify_default_dd() {
        assert_eq!(
            BackingCategory::classify(Path::new("image.dd")),
            BackingCategory::Dd
        );
        assert_eq!(
            BackingCategory::classify(Path::new("image.raw")),
            BackingCategory::Dd
        );
    }

    #[test]
    fn non_split_path_expands_to_itself() {
        let p = PathBuf::from("/tmp/image.dd");
        assert_eq!(expand(&p), vec![p]);
    }

    #[test]
    fn encase_glob_pattern_shape() {
        let g = encase_glob(Path::new("/tmp/image.E01"));
        assert_eq!(g, "/tmp/image.E??");
    }

    #[test]
    fn numeric_glob_pattern_shape() {
        let g = numeric_glob(Path::new("/tmp/image.001"));
        assert_eq!(g, "/tmp/image.[0-9][0-9]?");
    }

    #[test]
    fn expand_falls_back_to_verbatim_when_glob_empty() {
        let p = PathBuf::from("/definitely/does/not/exist.E01");
        assert_eq!(expand(&p), vec![p]);
    }
}
