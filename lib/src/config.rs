//! Parsing and validation of the repository `config` file.

use anyhow::{Context, Result};
use tini::Ini;

use crate::error::Error;

/// How file content is encoded on disk.  Chosen at repository creation and
/// immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Real files with original ownership, permissions and xattrs; requires
    /// privileges to check in arbitrary content.
    Bare,
    /// Files owned by the current user; original metadata is preserved in a
    /// dedicated extended attribute, and symlinks become regular files.
    BareUser,
    /// Files owned by the current user with no metadata preservation at all;
    /// ownership reads back as 0/0 with no xattrs.
    BareUserOnly,
    /// zlib-compressed framed blobs with inline metadata, suitable for
    /// serving over a dumb static web server.
    Archive,
}

impl StorageMode {
    /// The identifier written to `core.mode`.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Bare => "bare",
            StorageMode::BareUser => "bare-user",
            StorageMode::BareUserOnly => "bare-user-only",
            StorageMode::Archive => "archive-z2",
        }
    }

    /// Parse `core.mode`.  Both the modern and the historical spelling of
    /// the archive mode are accepted.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "bare" => StorageMode::Bare,
            "bare-user" => StorageMode::BareUser,
            "bare-user-only" => StorageMode::BareUserOnly,
            "archive" | "archive-z2" => StorageMode::Archive,
            o => {
                return Err(Error::InvalidConfig(format!("Unknown repository mode '{o}'")).into());
            }
        })
    }

    /// Whether loose file objects carry their metadata in the filesystem
    /// rather than in a serialized header.
    pub fn is_bare(&self) -> bool {
        !matches!(self, StorageMode::Archive)
    }
}

/// Parsed repository configuration with derived policy.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// The verbatim configuration text; rewrites (e.g. remote
    /// addition) re-parse this rather than holding parser state.
    pub(crate) text: String,
    /// The storage mode; see [`StorageMode`].
    pub mode: StorageMode,
    /// Keep decompressed copies of archive content objects.
    pub enable_uncompressed_cache: bool,
    /// Force data to stable storage before renames.
    pub fsync: bool,
    /// Skip xattr reads and writes in bare mode.
    pub disable_xattrs: bool,
    /// Age in seconds after which abandoned scratch entries are removed.
    pub tmp_expiry_secs: u64,
    /// zlib compression level for archive content, clamped to 1..=9.
    pub zlib_level: u32,
    /// Reject writes when free space drops below this percentage.
    pub min_free_space_percent: u32,
    /// Advertised in the summary when configured.
    pub collection_id: Option<String>,
    /// Path of a repository consulted on read misses.
    pub parent: Option<String>,
    /// Record deleted commits with tombstone markers.
    pub tombstone_commits: bool,
}

const CORE: &str = "core";

impl RepoConfig {
    /// Parse and validate configuration text.
    pub fn parse(text: &str) -> Result<Self> {
        let ini = Ini::from_string(text).context("Parsing repository config")?;
        let version: Option<String> = ini.get(CORE, "repo_version");
        match version.as_deref() {
            Some("1") => (),
            Some(o) => {
                return Err(
                    Error::InvalidConfig(format!("Invalid repository version '{o}'")).into(),
                );
            }
            None => {
                return Err(Error::InvalidConfig("Missing core.repo_version".into()).into());
            }
        }
        if ini.get(CORE, "archive") == Some(true) {
            return Err(Error::InvalidConfig(
                "This repository is using the old \"archive\" format; \
                 it must be recreated in mode \"archive-z2\""
                    .into(),
            )
            .into());
        }
        let mode = match ini.get::<String>(CORE, "mode") {
            Some(m) => StorageMode::parse(&m)?,
            None => StorageMode::Bare,
        };
        let zlib_level = ini
            .get::<u32>("archive", "zlib-level")
            .unwrap_or(6)
            .clamp(1, 9);
        let min_free_space_percent = ini.get(CORE, "min-free-space-percent").unwrap_or(3);
        if min_free_space_percent > 99 {
            return Err(Error::InvalidConfig(format!(
                "Invalid min-free-space-percent '{min_free_space_percent}'"
            ))
            .into());
        }
        Ok(Self {
            mode,
            enable_uncompressed_cache: ini.get(CORE, "enable-uncompressed-cache").unwrap_or(true),
            fsync: ini.get(CORE, "fsync").unwrap_or(true),
            disable_xattrs: ini.get(CORE, "disable-xattrs").unwrap_or(false),
            tmp_expiry_secs: ini.get(CORE, "tmp-expiry-secs").unwrap_or(86400),
            zlib_level,
            min_free_space_percent,
            collection_id: ini.get(CORE, "collection-id"),
            parent: ini.get(CORE, "parent"),
            tombstone_commits: ini.get(CORE, "tombstone-commits").unwrap_or(false),
            text: text.to_string(),
        })
    }

    /// The initial configuration written by repository creation.
    pub(crate) fn initial(mode: StorageMode) -> String {
        Ini::new()
            .section(CORE)
            .item("repo_version", "1")
            .item("mode", mode.as_str())
            .to_string()
    }
}
