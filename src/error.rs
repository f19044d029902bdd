//! Error taxonomy for the mount orchestration core.
//!
//! Every fallible operation in this crate returns [`Result<T>`], whose error
//! arm is a single enum rooted conceptually at `ImageMounterError`. The
//! taxonomy mirrors the subsystem-scoped error enums the rest of this
//! codebase's ancestry uses (one `thiserror` enum per concern) but flattened,
//! because the orchestration core is itself the single concern being modeled.

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the orchestration core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed user input: a bad key string, an unknown index pattern, an
    /// unknown method name passed across the shell/CLI boundary.
    #[error("argument error: {0}")]
    Argument(String),

    /// A required executable was not found on `PATH`.
    #[error("required command not found: {0}")]
    CommandNotFound(String),

    /// A required host module (kernel module, library, filesystem type) was
    /// not available.
    #[error("required module not available: {0}")]
    ModuleNotFound(String),

    /// A prerequisite other than a single command or module failed (e.g. a
    /// combination of probes).
    #[error("prerequisite failed: {0}")]
    PrerequisiteFailed(String),

    /// All candidates for a mount attempt completed without raising, but no
    /// usable mountpoint resulted.
    #[error("mountpoint was empty after mounting: {0}")]
    MountpointEmpty(PathBuf),

    /// A supplied key (LUKS passphrase/keyfile, BDE recovery key, ...) was
    /// rejected by the unlocking helper.
    #[error("key material was rejected by the unlocking helper")]
    KeyInvalid,

    /// Every backing-mount candidate in the fallback chain was exhausted.
    #[error("no backing mounter succeeded for {0}")]
    MountExhausted(PathBuf),

    /// An external helper exited nonzero or produced unparseable output, and
    /// the failure does not fit a more specific variant above.
    #[error("subsystem error running `{command}`: {detail}")]
    Subsystem { command: String, detail: String },

    /// No mountpoint directory could be created or accessed.
    #[error("no mountpoint available: {0}")]
    NoMountpointAvailable(String),

    /// No loopback device could be found or attached.
    #[error("no loopback device available: {0}")]
    NoLoopbackAvailable(String),

    /// No network block device could be reserved.
    #[error("no network block device available: {0}")]
    NoNetworkBlockAvailable(String),

    /// A filesystem kind was requested to be mounted but this implementation
    /// has no mounter for it (e.g. `swap`).
    #[error("unsupported filesystem: {0}")]
    UnsupportedFilesystem(String),

    /// A container filesystem's own identity probe (e.g. `cryptsetup
    /// isLuks`) rejected the volume.
    #[error("incorrect filesystem: expected {expected}, probe rejected the volume")]
    IncorrectFilesystem { expected: String },

    /// An operation required a volume/disk to be mounted, but it wasn't.
    #[error("not mounted: {0}")]
    NotMounted(String),

    /// `reconstruct()` could not find exactly one volume whose last mount
    /// point is `/`.
    #[error("could not find a root volume (lastmountpoint == \"/\") to reconstruct onto")]
    NoRootFound,

    /// A directory expected to be empty (and removed) after unmount still
    /// exists after the bounded retry window.
    #[error("cleanup failed: {0} still exists after unmount")]
    Cleanup(PathBuf),

    /// The disk-index invariant was violated (e.g. adding a second disk to a
    /// parser whose first disk has no index).
    #[error("disk index error: {0}")]
    DiskIndex(String),

    /// Wraps an I/O failure from a filesystem operation the core performs
    /// directly (creating/removing a mountpoint directory, reading /proc).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn subsystem(command: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Error::Subsystem {
            command: command.into(),
            detail: detail.to_string(),
        }
    }

    /// True for the small set of errors that the bulk-mount CLI treats as
    /// resumable (log it, move to the next candidate/volume) rather than
    /// fatal.
    pub fn is_non_fatal_for_bulk_mount(&self) -> bool {
        matches!(
            self,
            Error::MountpointEmpty(_)
                | Error::KeyInvalid
                | Error::UnsupportedFilesystem(_)
                | Error::IncorrectFilesystem { .. }
        )
    }
}
