//! # A content-addressed object store for operating system trees
//!
//! This crate implements the local half of an OSTree repository: loose
//! objects stored under `objects/` named by their SHA-256 digest, the three
//! bare storage modes plus the compressed archive mode, crash-safe staging
//! directories under `tmp/`, cross-repository imports, the parent-repository
//! fallback chain, remote configuration, and the signed `summary` index.
//!
//! The serialized object formats are byte-compatible with the original
//! implementation; a repository written by this crate can be served or
//! consumed by any other OSTree client.

// See https://doc.rust-lang.org/rustc/lints/listing/index.html
#![deny(missing_docs)]
// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

/// Our generic catchall fatal error, expected to be converted
/// to a string to output to a terminal or logs.
pub type Result<T> = anyhow::Result<T>;

mod cache;
mod checksum;
mod config;
mod content;
mod error;
mod gvfmt;
mod import;
mod objects;
mod objgv;
mod objtype;
mod refs;
mod remotes;
mod repo;
mod sign;
mod staging;
mod store;
mod summary;

pub use checksum::Checksum;
pub use config::{RepoConfig, StorageMode};
pub use content::{ContentPayload, ContentStream, FileInfo};
pub use error::{is_not_found, Cancellable, Error};
pub use gvfmt::{Variant, VariantDict};
pub use import::import_object;
pub use objects::{Commit, DirMeta, DirTree, FileHeader, Summary, SummaryRef, XattrList};
pub use objtype::{loose_path, ObjectName, ObjectType};
pub use remotes::Remote;
pub use repo::{CacheReservation, Repo, TransactionStats};
pub use sign::{set_gpg_engine, GpgEngine, KeyringSource, ALL_REMOTES, KEY_GPG_SIGS};
pub use store::{ListObjectsFlags, Metadata, ObjectDetails};
pub use summary::{
    regenerate_summary, KEY_COLLECTION_ID, KEY_COLLECTION_MAP, KEY_COMMIT_TIMESTAMP,
    KEY_LAST_MODIFIED, KEY_STATIC_DELTAS,
};

/// The name of the repository configuration file.
pub const CONFIG_FILE: &str = "config";
/// Directory holding loose objects, sharded by the first two checksum nybbles.
pub const OBJECTS_DIR: &str = "objects";
/// Per-repository scratch space; entries here may vanish at any open.
pub const TMP_DIR: &str = "tmp";
/// Per-remote caches, kept below [`TMP_DIR`] but exempt from expiry.
pub const TMP_CACHE_DIR: &str = "tmp/cache";
/// Decompressed copies of archive-mode content objects.
pub const UNCOMPRESSED_CACHE_DIR: &str = "uncompressed-objects-cache";
/// Markers for partially-fetched commits.
pub const STATE_DIR: &str = "state";
/// Reserved for repository extensions.
pub const EXTENSIONS_DIR: &str = "extensions";
/// Static delta storage, two-level sharded like `objects/`.
pub const DELTAS_DIR: &str = "deltas";
/// The ref database root.
pub const REFS_HEADS_DIR: &str = "refs/heads";
/// Mirrored (collection) refs.
pub const REFS_MIRRORS_DIR: &str = "refs/mirrors";
/// Remote-tracking refs.
pub const REFS_REMOTES_DIR: &str = "refs/remotes";
/// The serialized index of refs and deltas served to peers.
pub const SUMMARY_FILE: &str = "summary";
/// Detached signature over [`SUMMARY_FILE`].
pub const SUMMARY_SIG_FILE: &str = "summary.sig";

/// Overrides the default repository location for [`Repo::open_default`].
pub const ENV_REPO: &str = "OSTREE_REPO";
/// Overrides boot id discovery; used by tests simulating reboots.
pub const ENV_BOOTID: &str = "OSTREE_BOOTID";
/// Debug fault injection; the recognized flag is `pre-commit`.
pub const ENV_TEST_ERROR: &str = "OSTREE_REPO_TEST_ERROR";
