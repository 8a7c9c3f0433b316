//! Per-storage-mode encoding of file content objects.
//!
//! A file object is canonically a framed header (ownership, mode, symlink
//! target, xattrs) followed by the payload; its checksum is the SHA-256 of
//! that stream regardless of how the bytes land on disk.  The bare modes
//! store the payload raw and express the metadata through the filesystem
//! (or a dedicated xattr); archive mode keeps the header inline ahead of a
//! zlib-compressed payload.

use std::ffi::CString;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;

use anyhow::{anyhow, bail, Context, Result};
use cap_std::fs::{Dir, File, MetadataExt, OpenOptions};
use cap_std_ext::cap_std;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rustix::fs::XattrFlags;

use crate::checksum::{Checksum, Sha256Writer};
use crate::config::StorageMode;
use crate::objects::{DirMeta, FileHeader, XattrList};

/// The xattr carrying original file metadata in bare-user repositories.
pub(crate) const BARE_USER_XATTR: &str = "user.ostreemeta";

/// Limit on metadata objects (dirtree/dirmeta) and content headers.
pub(crate) const MAX_METADATA_SIZE: usize = 10 * 1024 * 1024;

/// Synthesized metadata describing a loaded file object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Full mode including the file type bits.
    pub mode: u32,
    /// Payload size in bytes; for symlinks, the target length.
    pub size: u64,
}

/// A readable stream over a file object's payload.
#[derive(Debug)]
pub struct ContentStream(StreamImpl);

enum StreamImpl {
    Raw(File),
    Inflate(Box<ZlibDecoder<File>>),
    Buf(std::io::Cursor<Vec<u8>>),
}

impl std::fmt::Debug for StreamImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamImpl::Raw(_) => "Raw",
            StreamImpl::Inflate(_) => "Inflate",
            StreamImpl::Buf(_) => "Buf",
        };
        f.write_str(name)
    }
}

impl ContentStream {
    pub(crate) fn from_file(f: File) -> Self {
        Self(StreamImpl::Raw(f))
    }

    pub(crate) fn from_inflater(d: ZlibDecoder<File>) -> Self {
        Self(StreamImpl::Inflate(Box::new(d)))
    }

    pub(crate) fn from_bytes(b: Vec<u8>) -> Self {
        Self(StreamImpl::Buf(std::io::Cursor::new(b)))
    }

    /// Read the whole stream into memory.
    pub fn read_to_vec(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for ContentStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.0 {
            StreamImpl::Raw(f) => f.read(buf),
            StreamImpl::Inflate(d) => d.read(buf),
            StreamImpl::Buf(c) => c.read(buf),
        }
    }
}

/// The payload of a loaded file object.
#[derive(Debug)]
pub enum ContentPayload {
    /// Regular file content.
    Stream(ContentStream),
    /// The target of a symlink.
    Symlink(String),
}

/// Frame a serialized header: a big-endian length word, padding so the
/// header lands on an 8-byte boundary, then the header itself.  Payload
/// bytes follow immediately.
pub(crate) fn frame_header(header: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + header.len());
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(header);
    out
}

/// Inverse of [`frame_header`], reading from a stream.
pub(crate) fn read_framed_header(r: &mut impl Read) -> Result<Vec<u8>> {
    let mut word = [0u8; 4];
    r.read_exact(&mut word).context("Reading header size")?;
    let size = u32::from_be_bytes(word) as usize;
    if size > MAX_METADATA_SIZE {
        bail!("Content header of {size} bytes exceeds limit");
    }
    r.read_exact(&mut word).context("Reading header padding")?;
    let mut header = vec![0u8; size];
    r.read_exact(&mut header).context("Reading header")?;
    Ok(header)
}

/// The canonical checksum of a file object: the digest of the framed
/// header followed by the payload.
pub(crate) fn content_checksum(header: &FileHeader, payload: &[u8]) -> Result<Checksum> {
    let mut w = Sha256Writer::new(std::io::sink())?;
    w.write_all(&frame_header(&header.to_bytes()))?;
    w.write_all(payload)?;
    Ok(w.finish()?.0)
}

fn xattr_name_cstr(name: &[u8]) -> Result<CString> {
    CString::new(name.to_vec()).map_err(|_| anyhow!("Invalid xattr name with embedded NUL"))
}

/// Read all xattrs of an open file, sorted by name for checksum stability.
pub(crate) fn fgetxattrs(f: &File) -> Result<XattrList> {
    let names = loop {
        let size = rustix::fs::flistxattr(f, &mut [])?;
        let mut buf = vec![0u8; size];
        match rustix::fs::flistxattr(f, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                break buf;
            }
            Err(rustix::io::Errno::RANGE) => continue,
            Err(e) => return Err(std::io::Error::from(e)).context("flistxattr"),
        }
    };
    let mut out = XattrList::new();
    for name in names.split(|&b| b == 0).filter(|n| !n.is_empty()) {
        let cname = xattr_name_cstr(name)?;
        let value = loop {
            let size = rustix::fs::fgetxattr(f, &cname, &mut [])?;
            let mut buf = vec![0u8; size];
            match rustix::fs::fgetxattr(f, &cname, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    break buf;
                }
                Err(rustix::io::Errno::RANGE) => continue,
                Err(e) => return Err(std::io::Error::from(e)).context("fgetxattr"),
            }
        };
        out.push((name.to_vec(), value));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Path addressing `name` under `dir` through /proc, for the xattr calls
/// that have no *at variant (needed for symlinks).
fn proc_self_fd_path(dir: &Dir, name: &str) -> String {
    format!("/proc/self/fd/{}/{}", dir.as_raw_fd(), name)
}

/// Read the xattrs of a symlink at `name` under `dir`.
pub(crate) fn lgetxattrs_at(dir: &Dir, name: &str) -> Result<XattrList> {
    let path = proc_self_fd_path(dir, name);
    let names = loop {
        let size = rustix::fs::llistxattr(&path, &mut [])?;
        let mut buf = vec![0u8; size];
        match rustix::fs::llistxattr(&path, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                break buf;
            }
            Err(rustix::io::Errno::RANGE) => continue,
            Err(e) => return Err(std::io::Error::from(e)).context("llistxattr"),
        }
    };
    let mut out = XattrList::new();
    for name in names.split(|&b| b == 0).filter(|n| !n.is_empty()) {
        let cname = xattr_name_cstr(name)?;
        let value = loop {
            let size = rustix::fs::lgetxattr(&path, &cname, &mut [])?;
            let mut buf = vec![0u8; size];
            match rustix::fs::lgetxattr(&path, &cname, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    break buf;
                }
                Err(rustix::io::Errno::RANGE) => continue,
                Err(e) => return Err(std::io::Error::from(e)).context("lgetxattr"),
            }
        };
        out.push((name.to_vec(), value));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

fn fsetxattrs(f: &File, xattrs: &XattrList) -> Result<()> {
    for (name, value) in xattrs {
        let cname = xattr_name_cstr(name)?;
        rustix::fs::fsetxattr(f, &cname, value, XattrFlags::empty())
            .map_err(std::io::Error::from)
            .with_context(|| format!("fsetxattr {}", String::from_utf8_lossy(name)))?;
    }
    Ok(())
}

fn lsetxattrs_at(dir: &Dir, name: &str, xattrs: &XattrList) -> Result<()> {
    let path = proc_self_fd_path(dir, name);
    for (xname, value) in xattrs {
        let cname = xattr_name_cstr(xname)?;
        rustix::fs::lsetxattr(&path, &cname, value, XattrFlags::empty())
            .map_err(std::io::Error::from)
            .with_context(|| format!("lsetxattr {}", String::from_utf8_lossy(xname)))?;
    }
    Ok(())
}

fn read_xattr(f: &File, name: &str) -> Result<Option<Vec<u8>>> {
    loop {
        let size = match rustix::fs::fgetxattr(f, name, &mut []) {
            Ok(n) => n,
            Err(rustix::io::Errno::NODATA) => return Ok(None),
            Err(e) => return Err(std::io::Error::from(e)).context("fgetxattr"),
        };
        let mut buf = vec![0u8; size];
        match rustix::fs::fgetxattr(f, name, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(Some(buf));
            }
            Err(rustix::io::Errno::RANGE) => continue,
            Err(rustix::io::Errno::NODATA) => return Ok(None),
            Err(e) => return Err(std::io::Error::from(e)).context("fgetxattr"),
        }
    }
}

/// Knobs the write path takes from repository configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WritePolicy {
    pub(crate) mode: StorageMode,
    pub(crate) fsync: bool,
    pub(crate) zlib_level: u32,
    pub(crate) disable_xattrs: bool,
}

fn fchmod(f: &File, mode: u32) -> Result<()> {
    rustix::fs::fchmod(f, rustix::fs::Mode::from_raw_mode(mode))
        .map_err(std::io::Error::from)
        .context("fchmod")?;
    Ok(())
}

#[allow(unsafe_code)]
fn uid_gid_from_raw(uid: u32, gid: u32) -> (rustix::process::Uid, rustix::process::Gid) {
    // SAFETY: these are plain numeric wrappers; `from_raw` only rejects the
    // sentinel value `u32::MAX`, which is not a valid uid/gid to chown to.
    unsafe { (rustix::process::Uid::from_raw(uid), rustix::process::Gid::from_raw(gid)) }
}

/// Encode one file object into `dir` under the temporary `name`, applying
/// the storage-mode policy.  The caller renames it into place afterwards.
pub(crate) fn write_loose_content(
    dir: &Dir,
    name: &str,
    policy: &WritePolicy,
    header: &FileHeader,
    payload: &[u8],
) -> Result<()> {
    let symlink_target = if header.is_symlink() {
        if !payload.is_empty() {
            bail!("Symlink object has non-empty payload");
        }
        Some(header.symlink_target.as_str())
    } else {
        None
    };
    match policy.mode {
        StorageMode::Archive => {
            let f = dir.open_with(name, OpenOptions::new().write(true).create_new(true))?;
            let mut w = std::io::BufWriter::new(f);
            let zheader = header.to_zlib_bytes(payload.len() as u64);
            w.write_all(&frame_header(&zheader))?;
            let mut z = ZlibEncoder::new(w, flate2::Compression::new(policy.zlib_level));
            z.write_all(payload)?;
            let mut w = z.finish()?;
            w.flush()?;
            let f = w.into_inner().map_err(|e| anyhow!("Flushing: {e}"))?;
            fchmod(&f, 0o644)?;
            if policy.fsync {
                rustix::fs::fdatasync(&f).map_err(std::io::Error::from)?;
            }
        }
        StorageMode::BareUser => {
            // Symlinks are represented as regular files holding the target,
            // with the real metadata in the dedicated xattr.
            let content = symlink_target.map(str::as_bytes).unwrap_or(payload);
            let f = dir.open_with(name, OpenOptions::new().write(true).create_new(true))?;
            let mut w = std::io::BufWriter::new(f);
            w.write_all(content)?;
            w.flush()?;
            let f = w.into_inner().map_err(|e| anyhow!("Flushing: {e}"))?;
            let perms = if header.mode & 0o111 != 0 { 0o755 } else { 0o644 };
            fchmod(&f, perms)?;
            let meta = DirMeta {
                uid: header.uid,
                gid: header.gid,
                mode: header.mode,
                xattrs: header.xattrs.clone(),
            };
            rustix::fs::fsetxattr(&f, BARE_USER_XATTR, &meta.to_bytes(), XattrFlags::empty())
                .map_err(std::io::Error::from)
                .context("Writing metadata xattr")?;
            if policy.fsync {
                rustix::fs::fdatasync(&f).map_err(std::io::Error::from)?;
            }
        }
        StorageMode::BareUserOnly => {
            if let Some(target) = symlink_target {
                dir.symlink(target, name)?;
            } else {
                let f = dir.open_with(name, OpenOptions::new().write(true).create_new(true))?;
                let mut w = std::io::BufWriter::new(f);
                w.write_all(payload)?;
                w.flush()?;
                let f = w.into_inner().map_err(|e| anyhow!("Flushing: {e}"))?;
                fchmod(&f, header.mode & 0o777)?;
                if policy.fsync {
                    rustix::fs::fdatasync(&f).map_err(std::io::Error::from)?;
                }
            }
        }
        StorageMode::Bare => {
            let (uid, gid) = uid_gid_from_raw(header.uid, header.gid);
            if let Some(target) = symlink_target {
                dir.symlink(target, name)?;
                rustix::fs::chownat(
                    dir,
                    name,
                    Some(uid),
                    Some(gid),
                    rustix::fs::AtFlags::SYMLINK_NOFOLLOW,
                )
                .map_err(std::io::Error::from)
                .context("lchown")?;
                if !policy.disable_xattrs {
                    lsetxattrs_at(dir, name, &header.xattrs)?;
                }
            } else {
                let f = dir.open_with(name, OpenOptions::new().write(true).create_new(true))?;
                let mut w = std::io::BufWriter::new(f);
                w.write_all(payload)?;
                w.flush()?;
                let f = w.into_inner().map_err(|e| anyhow!("Flushing: {e}"))?;
                rustix::fs::fchown(&f, Some(uid), Some(gid))
                    .map_err(std::io::Error::from)
                    .context("fchown")?;
                fchmod(&f, header.mode & 0o7777)?;
                if !policy.disable_xattrs {
                    fsetxattrs(&f, &header.xattrs)?;
                }
                if policy.fsync {
                    rustix::fs::fdatasync(&f).map_err(std::io::Error::from)?;
                }
            }
        }
    }
    Ok(())
}

/// Load a loose file object, synthesizing file info per the storage mode.
pub(crate) fn load_loose_content(
    dir: &Dir,
    path: &str,
    mode: StorageMode,
    disable_xattrs: bool,
    uncompressed_cache: Option<&Dir>,
    cache_path: &str,
) -> Result<(ContentPayload, FileInfo, XattrList)> {
    match mode {
        StorageMode::Bare => {
            let md = dir.symlink_metadata(path)?;
            if md.file_type().is_symlink() {
                let target = dir.read_link(path)?;
                let target = target
                    .to_str()
                    .ok_or_else(|| anyhow!("Invalid non-UTF8 symlink target"))?
                    .to_string();
                let xattrs = if disable_xattrs {
                    XattrList::new()
                } else {
                    lgetxattrs_at(dir, path)?
                };
                let info = FileInfo {
                    uid: md.uid(),
                    gid: md.gid(),
                    mode: md.mode(),
                    size: target.len() as u64,
                };
                Ok((ContentPayload::Symlink(target), info, xattrs))
            } else {
                let f = dir.open(path)?;
                let md = f.metadata()?;
                let xattrs = if disable_xattrs {
                    XattrList::new()
                } else {
                    fgetxattrs(&f)?
                };
                let info = FileInfo {
                    uid: md.uid(),
                    gid: md.gid(),
                    mode: md.mode(),
                    size: md.len(),
                };
                Ok((ContentPayload::Stream(ContentStream::from_file(f)), info, xattrs))
            }
        }
        StorageMode::BareUser => {
            let f = dir.open(path)?;
            let md = f.metadata()?;
            let meta_bytes = read_xattr(&f, BARE_USER_XATTR)?
                .ok_or_else(|| anyhow!("Missing {BARE_USER_XATTR} xattr on {path}"))?;
            let meta = DirMeta::from_bytes(&meta_bytes)
                .with_context(|| format!("Parsing {BARE_USER_XATTR} of {path}"))?;
            let info = FileInfo {
                uid: meta.uid,
                gid: meta.gid,
                mode: meta.mode,
                size: md.len(),
            };
            if (meta.mode & libc::S_IFMT) == libc::S_IFLNK {
                // The link target is stored as the file content.
                let mut target = String::new();
                let mut f = f;
                f.read_to_string(&mut target)?;
                Ok((ContentPayload::Symlink(target), info, meta.xattrs))
            } else {
                Ok((
                    ContentPayload::Stream(ContentStream::from_file(f)),
                    info,
                    meta.xattrs,
                ))
            }
        }
        StorageMode::BareUserOnly => {
            let md = dir.symlink_metadata(path)?;
            if md.file_type().is_symlink() {
                let target = dir.read_link(path)?;
                let target = target
                    .to_str()
                    .ok_or_else(|| anyhow!("Invalid non-UTF8 symlink target"))?
                    .to_string();
                let info = FileInfo {
                    uid: 0,
                    gid: 0,
                    mode: libc::S_IFLNK | 0o777,
                    size: target.len() as u64,
                };
                Ok((ContentPayload::Symlink(target), info, XattrList::new()))
            } else {
                let f = dir.open(path)?;
                let md = f.metadata()?;
                let info = FileInfo {
                    uid: 0,
                    gid: 0,
                    mode: md.mode(),
                    size: md.len(),
                };
                Ok((
                    ContentPayload::Stream(ContentStream::from_file(f)),
                    info,
                    XattrList::new(),
                ))
            }
        }
        StorageMode::Archive => {
            let mut f = dir.open(path)?;
            let zheader = read_framed_header(&mut f)?;
            let (size, header) = FileHeader::from_zlib_bytes(&zheader)
                .with_context(|| format!("Parsing archive header of {path}"))?;
            let info = FileInfo {
                uid: header.uid,
                gid: header.gid,
                mode: header.mode,
                size,
            };
            if header.is_symlink() {
                return Ok((
                    ContentPayload::Symlink(header.symlink_target),
                    info,
                    header.xattrs,
                ));
            }
            // Prefer a decompressed copy when the cache has one.
            if let Some(cache) = uncompressed_cache {
                if let Some(cached) = cache
                    .open(cache_path)
                    .map(Some)
                    .or_else(|e| {
                        if e.raw_os_error() == Some(libc::ENOENT) {
                            Ok(None)
                        } else {
                            Err(e)
                        }
                    })?
                {
                    return Ok((
                        ContentPayload::Stream(ContentStream::from_file(cached)),
                        info,
                        header.xattrs,
                    ));
                }
            }
            let stream = ContentStream::from_inflater(ZlibDecoder::new(f));
            Ok((ContentPayload::Stream(stream), info, header.xattrs))
        }
    }
}
