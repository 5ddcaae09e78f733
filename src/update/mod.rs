//! Secure OTA update pipeline.
//!
//! Version bookkeeping, package signatures, archive handling and the client
//! that drives check → download → verify → install → restart with rollback.

pub mod client;
pub mod package;
pub mod signature;
pub mod version;

pub use client::{ProgressCallback, UpdateClient, UpdateInfo, UpdateStatus};
pub use package::{PackageFileEntry, PackageInfo};
pub use signature::{SignatureInfo, SignatureManager, METHOD_HMAC, METHOD_RSA};
pub use version::{parse_version, VersionManager};
