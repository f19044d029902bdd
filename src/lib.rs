//! Mount orchestration core for forensic disk images: exposes an image
//! file as a block-addressable backing, discovers the nested hierarchy of
//! volume systems/volumes/containers/filesystems it contains, mounts each
//! node with the right external subsystem, and unwinds every acquired
//! resource in reverse order.
//!
//! The CLI and interactive shell in `src/bin/` are thin consumers of
//! [`parser::Parser`]; no orchestration logic lives outside this library.

pub mod classifier;
pub mod config;
pub mod dependencies;
pub mod disk;
pub mod disk_backing;
pub mod error;
pub mod filesystem;
pub mod logging;
pub mod mount_helpers;
pub mod parser;
pub mod path;
pub mod process;
pub mod sweeper;
pub mod volume;
pub mod volume_system;

pub use config::Config;
pub use error::{Error, Result};
pub use parser::Parser;
