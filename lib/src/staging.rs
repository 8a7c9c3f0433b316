//! Per-boot, lock-owned staging directories under `tmp/`.
//!
//! Transactions write objects into a staging directory named
//! `staging-<boot id>-<random>`; only at commit are they renamed into
//! `objects/`.  The boot id in the name is what makes the scheme crash-safe:
//! a leftover directory from an earlier boot may contain data that never
//! reached stable storage, so it is discarded rather than reused.
//!
//! Each directory is guarded by a sibling `<name>-lock` file held under a
//! non-blocking `flock`.  Keeping the lock outside the directory lets the
//! directory be unlinked while the lock is still held.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use cap_std_ext::cap_std;
use cap_std::fs::{Dir, File, OpenOptions};
use rustix::fs::{AtFlags, FlockOperation, Timespec, Timestamps};
use tracing::debug;

/// Name prefix of transaction staging directories (the boot id follows).
pub(crate) const STAGING_PREFIX: &str = "staging-";
/// Name prefix of pull scratch directories; these are expired by age.
#[allow(dead_code)]
pub(crate) const FETCHER_PREFIX: &str = "fetcher-";
const LOCK_SUFFIX: &str = "-lock";
/// The per-remote cache directory under `tmp/`, exempt from expiry.
const TMP_CACHE_NAME: &str = "cache";

/// Read the current boot id, honoring the test override.
pub(crate) fn boot_id() -> Result<String> {
    if let Some(v) = std::env::var_os(crate::ENV_BOOTID) {
        let v = v
            .into_string()
            .map_err(|_| anyhow::anyhow!("Invalid non-UTF8 {}", crate::ENV_BOOTID))?;
        return Ok(v);
    }
    let s = std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .context("Reading boot id")?;
    Ok(s.trim().to_string())
}

/// An allocated staging directory with its held lock.
#[derive(Debug)]
pub(crate) struct StagingDir {
    pub(crate) name: String,
    pub(crate) dir: Dir,
    pub(crate) reused: bool,
    // Dropping the file releases the flock.
    _lockfile: File,
}

/// Try to take the lock guarding `name`, creating the lock file if needed.
/// Returns `None` when another process holds it.
fn try_lock(tmp: &Dir, name: &str) -> Result<Option<File>> {
    let lockname = format!("{name}{LOCK_SUFFIX}");
    let f = tmp
        .open_with(&lockname, OpenOptions::new().create(true).write(true))
        .with_context(|| format!("Opening lock file {lockname}"))?;
    match rustix::fs::flock(&f, FlockOperation::NonBlockingLockExclusive) {
        Ok(()) => Ok(Some(f)),
        Err(rustix::io::Errno::WOULDBLOCK) => Ok(None),
        Err(e) => Err(std::io::Error::from(e)).with_context(|| format!("Locking {lockname}")),
    }
}

fn now_timespec() -> Timespec {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timespec {
        tv_sec: d.as_secs() as i64,
        tv_nsec: d.subsec_nanos() as _,
    }
}

fn touch(tmp: &Dir, name: &str) -> Result<()> {
    let now = now_timespec();
    rustix::fs::utimensat(
        tmp,
        name,
        &Timestamps {
            last_access: now,
            last_modification: now,
        },
        AtFlags::empty(),
    )
    .with_context(|| format!("Updating mtime of {name}"))?;
    Ok(())
}

/// Allocate a directory with the given prefix: reuse any existing one whose
/// lock is free, else create a fresh one.
pub(crate) fn allocate(tmp: &Dir, prefix: &str) -> Result<StagingDir> {
    for entry in tmp.entries().context("Reading tmp/")? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.starts_with(prefix) || !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(lock) = try_lock(tmp, &name)? {
            touch(tmp, &name)?;
            debug!("Reusing staging directory {name}");
            let dir = tmp.open_dir(&name)?;
            return Ok(StagingDir {
                name,
                dir,
                reused: true,
                _lockfile: lock,
            });
        }
    }
    loop {
        let name = format!("{prefix}{}", uuid::Uuid::new_v4().simple());
        match tmp.create_dir(&name) {
            Ok(()) => (),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => continue,
            Err(e) => return Err(e).with_context(|| format!("Creating {name}")),
        }
        // A concurrent allocator can race us to the lock of the directory we
        // just created; if so, leave it to them and try again.
        match try_lock(tmp, &name)? {
            Some(lock) => {
                let dir = tmp.open_dir(&name)?;
                return Ok(StagingDir {
                    name,
                    dir,
                    reused: false,
                    _lockfile: lock,
                });
            }
            None => continue,
        }
    }
}

/// Clean `tmp/` at repository open: staging directories from other boots are
/// discarded (if their lock is free), and any other entry past the expiry
/// age is removed.  `tmp/cache` is never touched.
pub(crate) fn cleanup_tmp(tmp: &Dir, current_staging_prefix: &str, expiry_secs: u64) -> Result<()> {
    use cap_std::fs::MetadataExt;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    for entry in tmp.entries().context("Reading tmp/")? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name == TMP_CACHE_NAME {
            continue;
        }
        let is_dir = entry.file_type()?.is_dir();
        if name.starts_with(STAGING_PREFIX) && is_dir {
            if name.starts_with(current_staging_prefix) {
                // Same boot; a live writer may hold it, and the allocator
                // will happily reuse it otherwise.
                continue;
            }
            if let Some(_lock) = try_lock(tmp, &name)? {
                debug!("Removing stale staging directory {name}");
                tmp.remove_dir_all(&name)
                    .with_context(|| format!("Removing {name}"))?;
                match tmp.remove_file(format!("{name}{LOCK_SUFFIX}")) {
                    Ok(()) => (),
                    Err(e) if e.raw_os_error() == Some(libc::ENOENT) => (),
                    Err(e) => return Err(e.into()),
                }
            }
            continue;
        }
        if name.ends_with(LOCK_SUFFIX) {
            // Cleaned up along with its directory; remove only orphans.
            let dirname = &name[..name.len() - LOCK_SUFFIX.len()];
            if tmp.try_exists(dirname)? {
                continue;
            }
        }
        let mtime = entry.metadata()?.mtime();
        if now.saturating_sub(mtime) >= expiry_secs as i64 {
            debug!("Expiring abandoned tmp entry {name}");
            if is_dir {
                tmp.remove_dir_all(&name)?;
            } else {
                tmp.remove_file(&name)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std::ambient_authority;

    fn tmpdir() -> (tempfile::TempDir, Dir) {
        let td = tempfile::tempdir().unwrap();
        let d = Dir::open_ambient_dir(td.path(), ambient_authority()).unwrap();
        (td, d)
    }

    #[test]
    fn test_allocate_and_reuse() {
        let (_td, d) = tmpdir();
        let prefix = "staging-feedc0de-";
        let first = allocate(&d, prefix).unwrap();
        assert!(!first.reused);
        assert!(first.name.starts_with(prefix));

        // While the first allocation holds its lock, a second allocator must
        // get a different directory.
        let second = allocate(&d, prefix).unwrap();
        assert!(!second.reused);
        assert_ne!(first.name, second.name);

        // Once released, the directory is reused.
        let name = first.name.clone();
        drop(first);
        let third = allocate(&d, prefix).unwrap();
        assert!(third.reused);
        assert_eq!(third.name, name);
    }

    #[test]
    fn test_cleanup_stale_boot() {
        let (_td, d) = tmpdir();
        let stale = allocate(&d, "staging-oldboot-").unwrap();
        let stale_name = stale.name.clone();
        d.write(format!("{stale_name}/leftover.commit"), b"junk")
            .unwrap();
        drop(stale);

        let live = allocate(&d, "staging-newboot-").unwrap();
        cleanup_tmp(&d, "staging-newboot-", 86400).unwrap();
        assert!(!d.try_exists(&stale_name).unwrap());
        assert!(!d.try_exists(format!("{stale_name}-lock")).unwrap());
        assert!(d.try_exists(&live.name).unwrap());
    }

    #[test]
    fn test_cleanup_skips_locked() {
        let (_td, d) = tmpdir();
        let stale = allocate(&d, "staging-oldboot-").unwrap();
        // Still held: cleanup from a "new boot" must leave it alone.
        cleanup_tmp(&d, "staging-newboot-", 86400).unwrap();
        assert!(d.try_exists(&stale.name).unwrap());
    }

    #[test]
    fn test_cleanup_expiry() {
        let (_td, d) = tmpdir();
        d.create_dir("cache").unwrap();
        d.create_dir("fetcher-abc").unwrap();
        d.write("orphan", b"x").unwrap();
        // Zero expiry ages everything out immediately.
        cleanup_tmp(&d, "staging-x-", 0).unwrap();
        assert!(d.try_exists("cache").unwrap());
        assert!(!d.try_exists("fetcher-abc").unwrap());
        assert!(!d.try_exists("orphan").unwrap());
    }
}
