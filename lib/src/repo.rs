//! The repository handle: open/create, transactions, parent chaining.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use cap_std::fs::{Dir, DirBuilder, MetadataExt};
use cap_std_ext::cap_std;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::fs::{Access, AtFlags};
use tracing::debug;

use crate::cache::DirmetaCache;
use crate::config::{RepoConfig, StorageMode};
use crate::error::{check_cancel, Cancellable, Error};
use crate::remotes::{self, Remote};
use crate::staging::{self, StagingDir, STAGING_PREFIX};

/// Counters reported by a committed transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionStats {
    /// Metadata objects (commits, dirtrees, dirmetas) written.
    pub metadata_objects_written: u32,
    /// File content objects written.
    pub content_objects_written: u32,
}

pub(crate) struct Transaction {
    pub(crate) staging: StagingDir,
    pub(crate) stats: TransactionStats,
}

/// An open repository.
///
/// The handle exclusively owns its directory file descriptors; the optional
/// parent repository is shared and consulted (read-only) when a lookup
/// misses locally.
pub struct Repo {
    path: PathBuf,
    dir: Dir,
    objects: Dir,
    tmp: Option<Dir>,
    uncompressed_cache: Option<Dir>,
    config: RepoConfig,
    config_text: Mutex<String>,
    writable: bool,
    writable_error: Option<String>,
    owner_uid: u32,
    boot_id: String,
    parent: Option<Arc<Repo>>,
    pub(crate) dirmeta_cache: Mutex<DirmetaCache>,
    pub(crate) remotes: Mutex<BTreeMap<String, Remote>>,
    pub(crate) remotes_config_dir: Option<PathBuf>,
    pub(crate) txn: Mutex<Option<Transaction>>,
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo")
            .field("path", &self.path)
            .field("mode", &self.config.mode)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

impl Repo {
    /// Open an existing repository.
    pub fn open(path: impl AsRef<Path>) -> Result<Repo> {
        Self::open_with_remotes_dir(path, None)
    }

    /// Open an existing repository with an explicit directory for per-remote
    /// configuration drop-ins (normally `<sysroot>/etc/ostree/remotes.d`).
    pub fn open_with_remotes_dir(
        path: impl AsRef<Path>,
        remotes_config_dir: Option<PathBuf>,
    ) -> Result<Repo> {
        let mut visited = HashSet::new();
        Self::open_impl(path.as_ref(), remotes_config_dir, &mut visited)
    }

    /// Open the ambient default repository: the current directory if it
    /// looks like a repository, else `$OSTREE_REPO`, else the system one.
    pub fn open_default() -> Result<Repo> {
        if Path::new(crate::OBJECTS_DIR).is_dir() && Path::new(crate::CONFIG_FILE).is_file() {
            return Self::open(".");
        }
        if let Some(p) = std::env::var_os(crate::ENV_REPO) {
            return Self::open(PathBuf::from(p));
        }
        Self::open("/ostree/repo")
    }

    #[context("Opening repository at {}", path.display())]
    fn open_impl(
        path: &Path,
        remotes_config_dir: Option<PathBuf>,
        visited: &mut HashSet<PathBuf>,
    ) -> Result<Repo> {
        let path = std::fs::canonicalize(path).context("Resolving repository path")?;
        if !visited.insert(path.clone()) {
            return Err(Error::InvalidConfig(format!(
                "Parent repository chain forms a cycle at {}",
                path.display()
            ))
            .into());
        }
        let dir = Dir::open_ambient_dir(&path, cap_std::ambient_authority())?;
        let config_text = dir
            .read_to_string(crate::CONFIG_FILE)
            .context("Reading config")?;
        let config = RepoConfig::parse(&config_text)?;
        let objects = dir.open_dir(crate::OBJECTS_DIR).context("Opening objects/")?;
        let owner_uid = dir.dir_metadata()?.uid();
        let boot_id = staging::boot_id()?;

        let (writable, writable_error) =
            match rustix::fs::accessat(&dir, crate::OBJECTS_DIR, Access::WRITE_OK, AtFlags::empty())
            {
                Ok(()) => (true, None),
                Err(e) => (false, Some(std::io::Error::from(e).to_string())),
            };

        let staging_prefix = format!("{STAGING_PREFIX}{boot_id}-");
        let tmp = if writable {
            dir.ensure_dir_with(crate::TMP_DIR, &DirBuilder::new())?;
            let tmp = dir.open_dir(crate::TMP_DIR)?;
            tmp.ensure_dir_with("cache", &DirBuilder::new())?;
            staging::cleanup_tmp(&tmp, &staging_prefix, config.tmp_expiry_secs)
                .context("Cleaning tmp/")?;
            Some(tmp)
        } else {
            dir.open_dir_optional(crate::TMP_DIR)?
        };

        let uncompressed_cache = if config.mode == StorageMode::Archive
            && config.enable_uncompressed_cache
        {
            if writable {
                dir.ensure_dir_with(crate::UNCOMPRESSED_CACHE_DIR, &DirBuilder::new())?;
            }
            dir.open_dir_optional(crate::UNCOMPRESSED_CACHE_DIR)?
        } else {
            None
        };

        let parent = match config.parent.as_deref() {
            Some(p) => {
                let ppath = if Path::new(p).is_absolute() {
                    PathBuf::from(p)
                } else {
                    path.join(p)
                };
                let parent = Self::open_impl(&ppath, None, visited)
                    .with_context(|| format!("Opening parent repository {p}"))?;
                Some(Arc::new(parent))
            }
            None => None,
        };

        let remotes = remotes::discover(&config_text, remotes_config_dir.as_deref())?;
        debug!(
            "Opened repository at {} mode={} writable={writable}",
            path.display(),
            config.mode.as_str()
        );
        Ok(Repo {
            path,
            dir,
            objects,
            tmp,
            uncompressed_cache,
            config,
            config_text: Mutex::new(config_text),
            writable,
            writable_error,
            owner_uid,
            boot_id,
            parent,
            dirmeta_cache: Mutex::new(DirmetaCache::default()),
            remotes: Mutex::new(remotes),
            remotes_config_dir,
            txn: Mutex::new(None),
        })
    }

    /// Create a repository at `path` (which may already exist) and open it.
    /// Creation is idempotent: an existing `config` is left untouched, even
    /// if it records a different mode.
    #[context("Creating repository at {}", path.as_ref().display())]
    pub fn create(path: impl AsRef<Path>, mode: StorageMode) -> Result<Repo> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        if !dir.try_exists(crate::CONFIG_FILE)? {
            for d in [
                crate::OBJECTS_DIR,
                crate::TMP_DIR,
                crate::EXTENSIONS_DIR,
                crate::STATE_DIR,
                crate::REFS_HEADS_DIR,
                crate::REFS_MIRRORS_DIR,
                crate::REFS_REMOTES_DIR,
            ] {
                dir.create_dir_all(d)?;
            }
            dir.atomic_write(crate::CONFIG_FILE, RepoConfig::initial(mode).as_bytes())?;
        }
        Self::open(path)
    }

    /// The canonicalized filesystem path of this repository.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The storage mode, fixed at creation.
    pub fn mode(&self) -> StorageMode {
        self.config.mode
    }

    /// The parsed configuration.
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// The parent repository consulted on read misses, if configured.
    pub fn parent(&self) -> Option<&Repo> {
        self.parent.as_deref()
    }

    /// Whether the object directory was writable when the repository was
    /// opened.  The probe result is latched; see [`Self::ensure_writable`].
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn dir(&self) -> &Dir {
        &self.dir
    }

    pub(crate) fn objects(&self) -> &Dir {
        &self.objects
    }

    pub(crate) fn uncompressed_cache(&self) -> Option<&Dir> {
        self.uncompressed_cache.as_ref()
    }

    pub(crate) fn owner_uid(&self) -> u32 {
        self.owner_uid
    }

    pub(crate) fn tmp(&self) -> Result<&Dir> {
        self.tmp
            .as_ref()
            .ok_or_else(|| anyhow!("Repository has no tmp/ directory"))
    }

    fn staging_prefix(&self) -> String {
        format!("{STAGING_PREFIX}{}-", self.boot_id)
    }

    /// Replace the configuration file contents atomically.  The derived
    /// policy snapshot is not reloaded; callers only use this for state the
    /// registry tracks separately (remote sections).
    pub(crate) fn rewrite_config(&self, f: impl FnOnce(&str) -> Result<String>) -> Result<()> {
        self.ensure_writable()?;
        let mut guard = self.config_text.lock().unwrap();
        let new_text = f(&guard)?;
        self.dir
            .atomic_write(crate::CONFIG_FILE, new_text.as_bytes())
            .context("Replacing config")?;
        *guard = new_text;
        Ok(())
    }

    /// Surface the writability status latched at open.
    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            return Ok(());
        }
        let msg = self
            .writable_error
            .clone()
            .unwrap_or_else(|| "read-only".to_string());
        Err(Error::NotWritable(msg).into())
    }

    /// Reject writes once free space falls under the configured floor.
    pub(crate) fn check_free_space(&self) -> Result<()> {
        let min = self.config.min_free_space_percent as u64;
        if min == 0 {
            return Ok(());
        }
        let st = rustix::fs::fstatvfs(&self.objects).map_err(std::io::Error::from)?;
        if st.f_blocks == 0 {
            return Ok(());
        }
        let free_percent = st.f_bavail * 100 / st.f_blocks;
        if free_percent < min {
            bail!(
                "min-free-space-percent '{min}%' would be exceeded, at {free_percent}% available"
            );
        }
        Ok(())
    }

    /// Begin a transaction, allocating (or reusing) a staging directory.
    /// Returns whether an existing staging directory was resumed.
    #[context("Preparing transaction")]
    pub fn prepare_transaction(&self) -> Result<bool> {
        self.ensure_writable()?;
        self.check_free_space()?;
        let mut txn = self.txn.lock().unwrap();
        if txn.is_some() {
            bail!("Transaction already in progress");
        }
        let staging = staging::allocate(self.tmp()?, &self.staging_prefix())?;
        let resumed = staging.reused;
        debug!("Using staging directory {} resumed={resumed}", staging.name);
        *txn = Some(Transaction {
            staging,
            stats: TransactionStats::default(),
        });
        Ok(resumed)
    }

    /// Move every staged object into `objects/`, making the writes visible,
    /// then retire the staging directory.
    #[context("Committing transaction")]
    pub fn commit_transaction(
        &self,
        cancellable: Option<&Cancellable>,
    ) -> Result<TransactionStats> {
        let txn = {
            let mut guard = self.txn.lock().unwrap();
            guard
                .take()
                .ok_or_else(|| anyhow!("No transaction in progress"))?
        };
        if test_error_flag("pre-commit") {
            bail!("Injected failure via {}=pre-commit", crate::ENV_TEST_ERROR);
        }
        for entry in txn.staging.dir.entries()? {
            check_cancel(cancellable)?;
            let entry = entry?;
            let name = entry
                .file_name()
                .into_string()
                .map_err(|n| anyhow!("Invalid staged object name {n:?}"))?;
            // An interrupted write can leave a temporary behind; it is
            // discarded with the staging directory below.
            let stem_ok = name
                .split_once('.')
                .is_some_and(|(stem, _)| stem.len() == 64 && stem.bytes().all(|b| b.is_ascii_hexdigit()));
            if !stem_ok {
                debug!("Skipping stray staging entry {name}");
                continue;
            }
            let (prefix, rest) = name.split_at(2);
            match self.objects.create_dir(prefix) {
                Ok(()) => (),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => (),
                Err(e) => return Err(e).context("Creating object prefix directory"),
            }
            txn.staging
                .dir
                .rename(&name, &self.objects, format!("{prefix}/{rest}"))
                .with_context(|| format!("Publishing {name}"))?;
        }
        if self.config.fsync {
            rustix::fs::fsync(&self.objects).map_err(std::io::Error::from)?;
        }
        let tmp = self.tmp()?;
        tmp.remove_dir_all(&txn.staging.name)
            .with_context(|| format!("Removing {}", txn.staging.name))?;
        match tmp.remove_file(format!("{}-lock", txn.staging.name)) {
            Ok(()) => (),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => (),
            Err(e) => return Err(e.into()),
        }
        Ok(txn.stats)
    }

    /// Abandon the open transaction.  Staged objects stay on disk; the next
    /// allocator pass (or a post-reboot cleanup) reclaims them.
    pub fn abort_transaction(&self) -> Result<()> {
        let mut guard = self.txn.lock().unwrap();
        if guard.take().is_none() {
            bail!("No transaction in progress");
        }
        Ok(())
    }

    /// Whether a transaction is currently open.
    pub fn in_transaction(&self) -> bool {
        self.txn.lock().unwrap().is_some()
    }

    /// Reserve the directory-metadata cache for the lifetime of the returned
    /// token; see [`CacheReservation`].
    pub fn dirmeta_cache_reservation(&self) -> CacheReservation<'_> {
        self.dirmeta_cache.lock().unwrap().reserve();
        CacheReservation { repo: self }
    }
}

/// RAII token keeping the dirmeta cache alive.  Loads of directory metadata
/// populate the cache only while at least one token exists.
#[derive(Debug)]
pub struct CacheReservation<'a> {
    repo: &'a Repo,
}

impl Drop for CacheReservation<'_> {
    fn drop(&mut self) {
        self.repo.dirmeta_cache.lock().unwrap().release();
    }
}

/// Whether the given fault-injection flag is set in the environment.
fn test_error_flag(flag: &str) -> bool {
    std::env::var(crate::ENV_TEST_ERROR)
        .map(|v| v.split(',').any(|f| f.trim() == flag))
        .unwrap_or(false)
}
