//! Loose-object input/output: loading, storing, enumerating and deleting,
//! with transparent fallback to the parent repository on read misses.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cap_std::fs::{Dir, File};
use cap_std_ext::cap_std;
use fn_error_context::context;
use tracing::debug;

use crate::checksum::Checksum;
use crate::content::{self, ContentPayload, FileInfo, WritePolicy};
use crate::error::{check_cancel, Cancellable, Error};
use crate::gvfmt::{self, VariantDict};
use crate::objects::{Commit, DirMeta, DirTree, FileHeader, XattrList};
use crate::objtype::{loose_path_in_objects, parse_loose_name, staged_name, ObjectName, ObjectType};
use crate::repo::Repo;

/// Metadata objects larger than this are memory-mapped rather than read
/// into a buffer.
const METADATA_MMAP_THRESHOLD: u64 = 16 * 1024;

/// A loaded metadata object.  The backing memory (heap buffer or file
/// mapping) stays pinned for the lifetime of the value.
pub struct Metadata(MetadataBytes);

enum MetadataBytes {
    Buf(Vec<u8>),
    Mapped(memmap2::Mmap),
}

impl std::ops::Deref for Metadata {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.0 {
            MetadataBytes::Buf(v) => v,
            MetadataBytes::Mapped(m) => m,
        }
    }
}

impl AsRef<[u8]> for Metadata {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl std::fmt::Debug for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Metadata({} bytes)", self.len())
    }
}

#[allow(unsafe_code)]
fn map_file(f: std::fs::File) -> Result<memmap2::Mmap> {
    // SAFETY: loose objects are immutable once published; they are replaced
    // by rename, never rewritten in place.
    let mapping = unsafe { memmap2::Mmap::map(&f)? };
    Ok(mapping)
}

/// Which objects [`Repo::list_objects`] reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListObjectsFlags {
    /// Include loose objects.
    pub loose: bool,
    /// Include everything (currently equivalent to `loose`; packed objects
    /// are reserved).
    pub all: bool,
    /// Do not recurse into the parent repository.
    pub no_parents: bool,
}

/// How one enumerated object is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectDetails {
    /// Present as a loose file.
    pub loose: bool,
    /// Pack files containing the object; reserved, currently always empty.
    pub packs: Vec<String>,
}

/// Existence check that does not follow symlinks (bare-mode symlink objects
/// may dangle legitimately).
fn exists_nofollow(d: &Dir, path: &str) -> Result<bool> {
    match d.symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

enum LooseKind {
    Meta,
    Content,
}

impl Repo {
    fn staged_dir_clone(&self) -> Result<Option<Dir>> {
        let guard = self.txn.lock().unwrap();
        match guard.as_ref() {
            Some(txn) => Ok(Some(txn.staging.dir.try_clone()?)),
            None => Ok(None),
        }
    }

    fn object_not_found(&self, objtype: ObjectType, checksum: &Checksum) -> anyhow::Error {
        Error::ObjectNotFound(ObjectName::new(*checksum, objtype)).into()
    }

    /// Whether the object exists, in the open transaction's staging
    /// directory, the local object store, or anywhere up the parent chain.
    pub fn has_object(&self, objtype: ObjectType, checksum: &Checksum) -> Result<bool> {
        if self.has_object_local(objtype, checksum)? {
            return Ok(true);
        }
        match self.parent() {
            Some(parent) => parent.has_object(objtype, checksum),
            None => Ok(false),
        }
    }

    fn has_object_local(&self, objtype: ObjectType, checksum: &Checksum) -> Result<bool> {
        if let Some(staging) = self.staged_dir_clone()? {
            if exists_nofollow(&staging, &staged_name(checksum, objtype, self.mode()))? {
                return Ok(true);
            }
        }
        let path = loose_path_in_objects(checksum, objtype, self.mode());
        exists_nofollow(self.objects(), path.as_str())
    }

    fn load_metadata_local(
        &self,
        objtype: ObjectType,
        checksum: &Checksum,
    ) -> Result<Option<Metadata>> {
        if let Some(staging) = self.staged_dir_clone()? {
            let name = staged_name(checksum, objtype, self.mode());
            if let Some(mut f) = open_optional(&staging, &name)? {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                return Ok(Some(Metadata(MetadataBytes::Buf(buf))));
            }
        }
        let path = loose_path_in_objects(checksum, objtype, self.mode());
        let Some(mut f) = open_optional(self.objects(), path.as_str())? else {
            return Ok(None);
        };
        let size = f.metadata()?.len();
        if size > METADATA_MMAP_THRESHOLD {
            Ok(Some(Metadata(MetadataBytes::Mapped(map_file(
                f.into_std(),
            )?))))
        } else {
            let mut buf = Vec::with_capacity(size as usize);
            f.read_to_end(&mut buf)?;
            Ok(Some(Metadata(MetadataBytes::Buf(buf))))
        }
    }

    /// Load a serialized metadata object (commit, dirtree, dirmeta,
    /// detached commit metadata), searching the parent chain.
    pub fn load_metadata(&self, objtype: ObjectType, checksum: &Checksum) -> Result<Metadata> {
        if !objtype.is_meta() {
            bail!("Not a metadata object type: {objtype}");
        }
        if let Some(m) = self.load_metadata_local(objtype, checksum)? {
            return Ok(m);
        }
        match self.parent() {
            Some(parent) => parent.load_metadata(objtype, checksum),
            None => Err(self.object_not_found(objtype, checksum)),
        }
    }

    /// Like [`Self::load_metadata`], but exposed as a byte stream plus its
    /// size, for transfer paths that never decode.
    pub fn load_metadata_stream(
        &self,
        objtype: ObjectType,
        checksum: &Checksum,
    ) -> Result<(std::io::Cursor<Metadata>, u64)> {
        let m = self.load_metadata(objtype, checksum)?;
        let size = m.len() as u64;
        Ok((std::io::Cursor::new(m), size))
    }

    /// Load and parse a commit object.
    pub fn load_commit(&self, checksum: &Checksum) -> Result<Commit> {
        let m = self.load_metadata(ObjectType::Commit, checksum)?;
        Commit::from_bytes(&m).with_context(|| format!("Parsing commit {checksum}"))
    }

    /// Load and parse a directory listing.
    pub fn load_dirtree(&self, checksum: &Checksum) -> Result<DirTree> {
        let m = self.load_metadata(ObjectType::DirTree, checksum)?;
        DirTree::from_bytes(&m).with_context(|| format!("Parsing dirtree {checksum}"))
    }

    /// Load detached commit metadata.
    pub fn load_commit_meta(&self, checksum: &Checksum) -> Result<VariantDict> {
        let m = self.load_metadata(ObjectType::CommitMeta, checksum)?;
        gvfmt::parse_dict(&m).with_context(|| format!("Parsing commit metadata {checksum}"))
    }

    /// Load directory metadata, consulting the shared cache.  The cache is
    /// populated only while a [`crate::CacheReservation`] is held.
    pub fn load_dirmeta(&self, checksum: &Checksum) -> Result<Arc<DirMeta>> {
        if let Some(hit) = self.dirmeta_cache.lock().unwrap().lookup(checksum) {
            return Ok(hit);
        }
        let m = self.load_metadata(ObjectType::DirMeta, checksum)?;
        let parsed = Arc::new(
            DirMeta::from_bytes(&m).with_context(|| format!("Parsing dirmeta {checksum}"))?,
        );
        self.dirmeta_cache
            .lock()
            .unwrap()
            .insert(*checksum, Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Load a file object: its payload (stream or symlink target), the
    /// synthesized file info, and xattrs, per the storage-mode rules.
    pub fn load_file(&self, checksum: &Checksum) -> Result<(ContentPayload, FileInfo, XattrList)> {
        let mode = self.mode();
        let disable_xattrs = self.config().disable_xattrs;
        if let Some(staging) = self.staged_dir_clone()? {
            let name = staged_name(checksum, ObjectType::File, mode);
            if exists_nofollow(&staging, &name)? {
                return content::load_loose_content(&staging, &name, mode, disable_xattrs, None, "")
                    .with_context(|| format!("Loading staged content object {checksum}"));
            }
        }
        let path = loose_path_in_objects(checksum, ObjectType::File, mode);
        if exists_nofollow(self.objects(), path.as_str())? {
            let cache_path = cache_path_for(checksum);
            return content::load_loose_content(
                self.objects(),
                path.as_str(),
                mode,
                disable_xattrs,
                self.uncompressed_cache(),
                &cache_path,
            )
            .with_context(|| format!("Loading content object {checksum}"));
        }
        match self.parent() {
            Some(parent) => parent.load_file(checksum),
            None => Err(self.object_not_found(ObjectType::File, checksum)),
        }
    }

    /// Load any object as its canonical stream form: metadata objects are
    /// their raw bytes; file objects get the framed header synthesized ahead
    /// of the payload.
    pub fn load_object_stream(
        &self,
        objtype: ObjectType,
        checksum: &Checksum,
    ) -> Result<(Box<dyn Read + Send>, u64)> {
        if objtype.is_meta() {
            let (stream, size) = self.load_metadata_stream(objtype, checksum)?;
            return Ok((Box::new(stream), size));
        }
        let (payload, info, xattrs) = self.load_file(checksum)?;
        let mut header = FileHeader {
            uid: info.uid,
            gid: info.gid,
            mode: info.mode,
            rdev: 0,
            symlink_target: String::new(),
            xattrs,
        };
        match payload {
            ContentPayload::Symlink(target) => {
                header.symlink_target = target;
                let framed = content::frame_header(&header.to_bytes());
                let size = framed.len() as u64;
                Ok((Box::new(std::io::Cursor::new(framed)), size))
            }
            ContentPayload::Stream(s) => {
                let framed = content::frame_header(&header.to_bytes());
                let size = framed.len() as u64 + info.size;
                Ok((Box::new(std::io::Cursor::new(framed).chain(s)), size))
            }
        }
    }

    /// The on-disk size of the loose object.
    pub fn query_object_size(&self, objtype: ObjectType, checksum: &Checksum) -> Result<u64> {
        if let Some(staging) = self.staged_dir_clone()? {
            let name = staged_name(checksum, objtype, self.mode());
            match staging.symlink_metadata(&name) {
                Ok(md) => return Ok(md.len()),
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => (),
                Err(e) => return Err(e.into()),
            }
        }
        let path = loose_path_in_objects(checksum, objtype, self.mode());
        match self.objects().symlink_metadata(path.as_str()) {
            Ok(md) => Ok(md.len()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => match self.parent() {
                Some(parent) => parent.query_object_size(objtype, checksum),
                None => Err(self.object_not_found(objtype, checksum)),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a loose object.  Deleting a commit also removes its detached
    /// metadata, and (if `core.tombstone-commits` is set) records a
    /// tombstone.  The parent repository is never touched.
    #[context("Deleting {objtype} object {checksum}")]
    pub fn delete_object(&self, objtype: ObjectType, checksum: &Checksum) -> Result<()> {
        self.ensure_writable()?;
        let path = loose_path_in_objects(checksum, objtype, self.mode());
        match self.objects().remove_file(path.as_str()) {
            Ok(()) => (),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                return Err(self.object_not_found(objtype, checksum));
            }
            Err(e) => return Err(e.into()),
        }
        if objtype == ObjectType::Commit {
            // Detached metadata rides along with its commit.
            let meta = loose_path_in_objects(checksum, ObjectType::CommitMeta, self.mode());
            match self.objects().remove_file(meta.as_str()) {
                Ok(()) => (),
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => (),
                Err(e) => return Err(e.into()),
            }
            if self.config().tombstone_commits {
                self.write_metadata_trusted(ObjectType::TombstoneCommit, checksum, b"")?;
            }
        }
        debug!("Deleted {objtype} object {checksum}");
        Ok(())
    }

    /// Enumerate loose objects.  Unless suppressed, the parent chain is
    /// merged in; local entries win.
    pub fn list_objects(
        &self,
        flags: ListObjectsFlags,
        cancellable: Option<&Cancellable>,
    ) -> Result<BTreeMap<ObjectName, ObjectDetails>> {
        let mut out = BTreeMap::new();
        self.list_objects_into(flags, cancellable, &mut out)?;
        Ok(out)
    }

    fn list_objects_into(
        &self,
        flags: ListObjectsFlags,
        cancellable: Option<&Cancellable>,
        out: &mut BTreeMap<ObjectName, ObjectDetails>,
    ) -> Result<()> {
        if flags.loose || flags.all {
            self.enumerate_loose(cancellable, &mut |name| {
                out.entry(name).or_insert_with(|| ObjectDetails {
                    loose: true,
                    packs: Vec::new(),
                });
            })?;
        }
        if !flags.no_parents {
            if let Some(parent) = self.parent() {
                parent.list_objects_into(flags, cancellable, out)?;
            }
        }
        Ok(())
    }

    fn enumerate_loose(
        &self,
        cancellable: Option<&Cancellable>,
        f: &mut dyn FnMut(ObjectName),
    ) -> Result<()> {
        for prefix in 0u32..=0xFF {
            check_cancel(cancellable)?;
            let prefix = format!("{prefix:02x}");
            let Some(d) = open_dir_optional(self.objects(), &prefix)? else {
                continue;
            };
            for entry in d.entries()? {
                let entry = entry?;
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if let Some(obj) = parse_loose_name(&prefix, &name) {
                    f(obj);
                }
            }
        }
        Ok(())
    }

    /// Enumerate local commit objects whose checksum begins with `prefix`;
    /// used by short-hash resolution.
    pub fn list_commits_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<BTreeMap<ObjectName, ObjectDetails>> {
        if !prefix.bytes().all(|b| b.is_ascii_hexdigit()) || prefix.len() > 64 {
            bail!("Invalid checksum prefix '{prefix}'");
        }
        let mut out = BTreeMap::new();
        self.enumerate_loose(None, &mut |name| {
            if name.objtype == ObjectType::Commit && name.checksum.to_hex().starts_with(prefix) {
                out.entry(name).or_insert_with(|| ObjectDetails {
                    loose: true,
                    packs: Vec::new(),
                });
            }
        })?;
        if let Some(parent) = self.parent() {
            for (name, details) in parent.list_commits_with_prefix(prefix)? {
                out.entry(name).or_insert(details);
            }
        }
        Ok(out)
    }

    /// Write a metadata object, verifying the advertised checksum if given.
    /// Returns the computed checksum.
    #[context("Writing {objtype} object")]
    pub fn write_metadata(
        &self,
        objtype: ObjectType,
        expected: Option<&Checksum>,
        data: &[u8],
    ) -> Result<Checksum> {
        if !objtype.is_meta() {
            bail!("Not a metadata object type: {objtype}");
        }
        let actual = Checksum::digest(data)?;
        if let Some(expected) = expected {
            if expected != &actual {
                return Err(Error::ChecksumMismatch {
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                }
                .into());
            }
        }
        self.write_metadata_trusted(objtype, &actual, data)?;
        Ok(actual)
    }

    /// Write a metadata object under a caller-trusted checksum.
    pub fn write_metadata_trusted(
        &self,
        objtype: ObjectType,
        checksum: &Checksum,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_writable()?;
        self.check_free_space()?;
        if self.has_object_local(objtype, checksum)? {
            return Ok(());
        }
        let fsync = self.config().fsync;
        self.commit_loose_object(objtype, checksum, LooseKind::Meta, |dir, name| {
            write_file_bytes(dir, name, data, fsync)
        })
    }

    /// Write, replace, or (with `None`) delete the detached metadata object
    /// annotating a commit.
    pub fn write_commit_detached_metadata(
        &self,
        checksum: &Checksum,
        meta: Option<&VariantDict>,
    ) -> Result<()> {
        match meta {
            Some(meta) => self.write_metadata_overwrite(
                ObjectType::CommitMeta,
                checksum,
                &gvfmt::serialize_dict(meta),
            ),
            None => {
                self.ensure_writable()?;
                let path = loose_path_in_objects(checksum, ObjectType::CommitMeta, self.mode());
                match self.objects().remove_file(path.as_str()) {
                    Ok(()) => Ok(()),
                    Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Write or replace a metadata object that is addressed by an external
    /// name rather than its own digest; detached commit metadata is keyed
    /// by the commit it annotates and may legitimately change.
    pub(crate) fn write_metadata_overwrite(
        &self,
        objtype: ObjectType,
        checksum: &Checksum,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_writable()?;
        self.check_free_space()?;
        let fsync = self.config().fsync;
        self.commit_loose_object(objtype, checksum, LooseKind::Meta, |dir, name| {
            write_file_bytes(dir, name, data, fsync)
        })
    }

    /// Write a file content object, verifying the advertised checksum if
    /// given.  Returns the computed checksum.
    #[context("Writing content object")]
    pub fn write_content(
        &self,
        expected: Option<&Checksum>,
        header: &FileHeader,
        payload: &[u8],
    ) -> Result<Checksum> {
        let actual = content::content_checksum(header, payload)?;
        if let Some(expected) = expected {
            if expected != &actual {
                return Err(Error::ChecksumMismatch {
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                }
                .into());
            }
        }
        self.write_content_trusted(&actual, header, payload)?;
        Ok(actual)
    }

    /// Write a file content object under a caller-trusted checksum.
    pub fn write_content_trusted(
        &self,
        checksum: &Checksum,
        header: &FileHeader,
        payload: &[u8],
    ) -> Result<()> {
        self.ensure_writable()?;
        self.check_free_space()?;
        if self.has_object_local(ObjectType::File, checksum)? {
            return Ok(());
        }
        let policy = WritePolicy {
            mode: self.mode(),
            fsync: self.config().fsync,
            zlib_level: self.config().zlib_level,
            disable_xattrs: self.config().disable_xattrs,
        };
        self.commit_loose_object(ObjectType::File, checksum, LooseKind::Content, |dir, name| {
            content::write_loose_content(dir, name, &policy, header, payload)
        })
    }

    /// Place one encoded object: staged under the open transaction, or
    /// published immediately through `tmp/` when none is open.  `writer`
    /// produces the object at a temporary name; it is renamed into place.
    fn commit_loose_object(
        &self,
        objtype: ObjectType,
        checksum: &Checksum,
        kind: LooseKind,
        writer: impl FnOnce(&Dir, &str) -> Result<()>,
    ) -> Result<()> {
        let final_name = staged_name(checksum, objtype, self.mode());
        let tmpname = format!("tmpobject-{}", uuid::Uuid::new_v4().simple());
        if let Some(staging) = self.staged_dir_clone()? {
            writer(&staging, &tmpname)?;
            staging
                .rename(&tmpname, &staging, &final_name)
                .with_context(|| format!("Staging {final_name}"))?;
            let mut guard = self.txn.lock().unwrap();
            if let Some(txn) = guard.as_mut() {
                match kind {
                    LooseKind::Meta => txn.stats.metadata_objects_written += 1,
                    LooseKind::Content => txn.stats.content_objects_written += 1,
                }
            }
            return Ok(());
        }
        let tmp = self.tmp()?;
        writer(tmp, &tmpname)?;
        let (prefix, rest) = final_name.split_at(2);
        match self.objects().create_dir(prefix) {
            Ok(()) => (),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => (),
            Err(e) => return Err(e).context("Creating object prefix directory"),
        }
        tmp.rename(&tmpname, self.objects(), format!("{prefix}/{rest}"))
            .with_context(|| format!("Publishing {final_name}"))?;
        Ok(())
    }
}

fn cache_path_for(checksum: &Checksum) -> String {
    let hexed = checksum.to_hex();
    let (prefix, rest) = hexed.split_at(2);
    format!("{prefix}/{rest}.file")
}

fn open_optional(d: &Dir, path: &str) -> Result<Option<File>> {
    match d.open(path) {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn open_dir_optional(d: &Dir, path: &str) -> Result<Option<Dir>> {
    match d.open_dir(path) {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_file_bytes(dir: &Dir, name: &str, data: &[u8], fsync: bool) -> Result<()> {
    use std::io::Write;
    let mut f = dir.open_with(
        name,
        cap_std::fs::OpenOptions::new().write(true).create_new(true),
    )?;
    f.write_all(data)?;
    if fsync {
        rustix::fs::fdatasync(&f).map_err(std::io::Error::from)?;
    }
    Ok(())
}
