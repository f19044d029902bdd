//! Typed configuration carried by the [`crate::parser::Parser`] and
//! propagated down to every [`crate::disk::Disk`] and
//! [`crate::volume::Volume`] it creates.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::disk_backing::DiskMounterPref;
use crate::volume_system::VolumeDetectorPref;

/// An index-pattern key as described in §6: an exact dotted index
/// (`"1.2"`), `*` meaning "override every volume", or `?` meaning "use only
/// as a fallback when nothing else classified the volume".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexPattern {
    Exact(String),
    OverrideAll,
    Fallback,
}

impl IndexPattern {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "*" => IndexPattern::OverrideAll,
            "?" => IndexPattern::Fallback,
            other => IndexPattern::Exact(other.to_string()),
        }
    }
}

/// A map from index pattern to a value (volume-system type, filesystem
/// type, or key material), with the lookup precedence the spec requires:
/// an exact match wins, then `*` (which overrides everything), then `?`
/// (consulted only when the caller has no other classification).
#[derive(Debug, Clone, Default)]
pub struct PatternMap {
    exact: HashMap<String, String>,
    override_all: Option<String>,
    fallback: Option<String>,
}

impl PatternMap {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map = PatternMap::default();
        for (key, value) in pairs {
            match IndexPattern::parse(&key) {
                IndexPattern::Exact(k) => {
                    map.exact.insert(k, value);
                }
                IndexPattern::OverrideAll => map.override_all = Some(value),
                IndexPattern::Fallback => map.fallback = Some(value),
            }
        }
        map
    }

    /// Returns the override for `index`, if `*` is set.
    pub fn overridden(&self) -> Option<&str> {
        self.override_all.as_deref()
    }

    /// Returns the exact-match value for `index`, if any.
    pub fn exact(&self, index: &str) -> Option<&str> {
        self.exact.get(index).map(String::as_str)
    }

    /// Returns the fallback value, honoring the `"none"` sentinel which
    /// disables the fallback entirely (§6).
    pub fn fallback(&self) -> Option<&str> {
        match self.fallback.as_deref() {
            Some("none") => None,
            other => other,
        }
    }

    /// Full lookup: override-all beats exact-match beats fallback.
    pub fn resolve(&self, index: &str) -> Option<&str> {
        self.overridden()
            .or_else(|| self.exact(index))
            .or_else(|| self.fallback())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub casename: Option<String>,
    pub mountdir: Option<PathBuf>,
    pub pretty: bool,
    pub read_write: bool,
    pub disk_mounter: DiskMounterPref,
    pub volume_detector: VolumeDetectorPref,
    pub vstypes: PatternMap,
    pub fstypes: PatternMap,
    pub keys: PatternMap,
    /// Tri-state `--single`/`--no-single`: `None` means "try multi first,
    /// fall back to single on zero volumes" (the default, per §4.5/§4.9).
    pub single: Option<bool>,
    pub lazy_unmount: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            casename: None,
            mountdir: None,
            pretty: false,
            read_write: false,
            disk_mounter: DiskMounterPref::Auto,
            volume_detector: VolumeDetectorPref::Auto,
            vstypes: PatternMap::default(),
            fstypes: PatternMap::default(),
            keys: PatternMap::default(),
            single: None,
            lazy_unmount: false,
        }
    }
}

impl Config {
    pub fn mountdir_or_temp(&self) -> PathBuf {
        self.mountdir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_beats_fallback() {
        let map = PatternMap::from_pairs([
            ("1.2".to_string(), "ntfs".to_string()),
            ("?".to_string(), "ext".to_string()),
        ]);
        assert_eq!(map.resolve("1.2"), Some("ntfs"));
        assert_eq!(map.resolve("1.3"), Some("ext"));
    }

    #[test]
    fn override_all_wins_over_exact() {
        let map = PatternMap::from_pairs([
            ("1.2".to_string(), "ntfs".to_string()),
            ("*".to_string(), "fat".to_string()),
        ]);
        assert_eq!(map.resolve("1.2"), Some("fat"));
    }

    #[test]
    fn none_sentinel_disables_fallback() {
        let map = PatternMap::from_pairs([("?".to_string(), "none".to_string())]);
        assert_eq!(map.resolve("9.9"), None);
    }
}
