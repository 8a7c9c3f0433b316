//! Typed views of the serialized metadata objects.
//!
//! Each type (de)serializes to the canonical wire form; writing the same
//! logical value twice always yields byte-identical output, which is what
//! makes content addressing sound.

use anyhow::{bail, Context, Result};

use crate::checksum::Checksum;
use crate::gvfmt::{
    self, parse_string, serialize_string, serialize_var_array, split_var_array, Member,
    TupleReader, VariantDict,
};

/// Extended attributes as (name, value) pairs.  Names are raw bytes without
/// the trailing NUL the wire format carries.
pub type XattrList = Vec<(Vec<u8>, Vec<u8>)>;

pub(crate) fn serialize_xattrs(xattrs: &XattrList) -> Vec<u8> {
    let elems = xattrs
        .iter()
        .map(|(name, value)| {
            let mut name_z = name.clone();
            name_z.push(0);
            gvfmt::serialize_tuple(vec![
                Member::variable(name_z, 1),
                Member::variable(value.clone(), 1),
            ])
        })
        .collect();
    serialize_var_array(elems, 1)
}

pub(crate) fn parse_xattrs(d: &[u8]) -> Result<XattrList> {
    let mut out = XattrList::new();
    for entry in split_var_array(d, 1)? {
        let mut t = TupleReader::new(entry, 1);
        let mut name = t.variable(1)?.to_vec();
        if name.pop() != Some(0) {
            bail!("Invalid xattr name");
        }
        out.push((name, t.last(1)?.to_vec()));
    }
    Ok(out)
}

fn checksum_member(c: &Checksum) -> Vec<u8> {
    c.as_bytes().to_vec()
}

/// Ownership, permissions and xattrs of a directory.  The identical wire
/// shape doubles as the file metadata stored in the `user.ostreemeta`
/// extended attribute by user-mode repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirMeta {
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Full mode including the file type bits.
    pub mode: u32,
    /// Extended attributes.
    pub xattrs: XattrList,
}

impl DirMeta {
    /// Serialize to the canonical wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        gvfmt::serialize_tuple(vec![
            Member::fixed(self.uid.to_be_bytes().to_vec(), 4),
            Member::fixed(self.gid.to_be_bytes().to_vec(), 4),
            Member::fixed(self.mode.to_be_bytes().to_vec(), 4),
            Member::variable(serialize_xattrs(&self.xattrs), 1),
        ])
    }

    /// Parse the canonical wire form.
    pub fn from_bytes(d: &[u8]) -> Result<Self> {
        let mut t = TupleReader::new(d, 0);
        let uid = u32::from_be_bytes(t.fixed(4, 4)?.try_into().unwrap());
        let gid = u32::from_be_bytes(t.fixed(4, 4)?.try_into().unwrap());
        let mode = u32::from_be_bytes(t.fixed(4, 4)?.try_into().unwrap());
        let xattrs = parse_xattrs(t.last(1)?)?;
        Ok(Self {
            uid,
            gid,
            mode,
            xattrs,
        })
    }
}

/// A directory listing: child files and subdirectories, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirTree {
    /// (name, content checksum) for each regular file or symlink.
    pub files: Vec<(String, Checksum)>,
    /// (name, dirtree checksum, dirmeta checksum) for each subdirectory.
    pub dirs: Vec<(String, Checksum, Checksum)>,
}

impl DirTree {
    /// Serialize to the canonical wire form.  Entries are sorted by name on
    /// the way out, so insertion order cannot perturb the checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut files = self.files.clone();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        let mut dirs = self.dirs.clone();
        dirs.sort_by(|a, b| a.0.cmp(&b.0));
        let files = files
            .iter()
            .map(|(name, csum)| {
                gvfmt::serialize_tuple(vec![
                    Member::variable(serialize_string(name), 1),
                    Member::variable(checksum_member(csum), 1),
                ])
            })
            .collect();
        let dirs = dirs
            .iter()
            .map(|(name, tree, meta)| {
                gvfmt::serialize_tuple(vec![
                    Member::variable(serialize_string(name), 1),
                    Member::variable(checksum_member(tree), 1),
                    Member::variable(checksum_member(meta), 1),
                ])
            })
            .collect();
        gvfmt::serialize_tuple(vec![
            Member::variable(serialize_var_array(files, 1), 1),
            Member::variable(serialize_var_array(dirs, 1), 1),
        ])
    }

    /// Parse the canonical wire form.
    pub fn from_bytes(d: &[u8]) -> Result<Self> {
        let mut t = TupleReader::new(d, 1);
        let files_d = t.variable(1)?;
        let dirs_d = t.last(1)?;
        let mut files = Vec::new();
        for entry in split_var_array(files_d, 1)? {
            let mut t = TupleReader::new(entry, 1);
            let name = parse_string(t.variable(1)?)?;
            let csum = Checksum::from_bytes(t.last(1)?)?;
            files.push((name, csum));
        }
        let mut dirs = Vec::new();
        for entry in split_var_array(dirs_d, 1)? {
            let mut t = TupleReader::new(entry, 2);
            let name = parse_string(t.variable(1)?)?;
            let tree = Checksum::from_bytes(t.variable(1)?)?;
            let meta = Checksum::from_bytes(t.last(1)?)?;
            dirs.push((name, tree, meta));
        }
        Ok(Self { files, dirs })
    }
}

/// The top-level object sealing a tree: root pointers, parent history,
/// subject/body, timestamp and a metadata dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Arbitrary metadata.
    pub metadata: VariantDict,
    /// The previous commit in history, if any.
    pub parent: Option<Checksum>,
    /// Related objects: (ref name, checksum).
    pub related: Vec<(String, Checksum)>,
    /// One-line summary.
    pub subject: String,
    /// Full description; may be empty.
    pub body: String,
    /// Seconds since the epoch, UTC.
    pub timestamp: u64,
    /// The root directory listing.
    pub root_tree: Checksum,
    /// Metadata of the root directory.
    pub root_meta: Checksum,
}

impl Commit {
    /// Serialize to the canonical wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let parent = match &self.parent {
            Some(c) => checksum_member(c),
            None => Vec::new(),
        };
        let related = self
            .related
            .iter()
            .map(|(name, csum)| {
                gvfmt::serialize_tuple(vec![
                    Member::variable(serialize_string(name), 1),
                    Member::variable(checksum_member(csum), 1),
                ])
            })
            .collect();
        gvfmt::serialize_tuple(vec![
            Member::variable(gvfmt::serialize_dict(&self.metadata), 8),
            Member::variable(parent, 1),
            Member::variable(serialize_var_array(related, 1), 1),
            Member::variable(serialize_string(&self.subject), 1),
            Member::variable(serialize_string(&self.body), 1),
            Member::fixed(self.timestamp.to_be_bytes().to_vec(), 8),
            Member::variable(checksum_member(&self.root_tree), 1),
            Member::variable(checksum_member(&self.root_meta), 1),
        ])
    }

    /// Parse the canonical wire form.
    pub fn from_bytes(d: &[u8]) -> Result<Self> {
        let mut t = TupleReader::new(d, 6);
        let metadata = gvfmt::parse_dict(t.variable(8)?).context("Parsing commit metadata")?;
        let parent_d = t.variable(1)?;
        let parent = if parent_d.is_empty() {
            None
        } else {
            Some(Checksum::from_bytes(parent_d)?)
        };
        let mut related = Vec::new();
        for entry in split_var_array(t.variable(1)?, 1)? {
            let mut t = TupleReader::new(entry, 1);
            let name = parse_string(t.variable(1)?)?;
            let csum = Checksum::from_bytes(t.last(1)?)?;
            related.push((name, csum));
        }
        let subject = parse_string(t.variable(1)?)?;
        let body = parse_string(t.variable(1)?)?;
        let timestamp = u64::from_be_bytes(t.fixed(8, 8)?.try_into().unwrap());
        let root_tree = Checksum::from_bytes(t.variable(1)?)?;
        let root_meta = Checksum::from_bytes(t.last(1)?)?;
        Ok(Self {
            metadata,
            parent,
            related,
            subject,
            body,
            timestamp,
            root_tree,
            root_meta,
        })
    }
}

/// The per-file metadata header leading every file content stream; in
/// archive repositories a variant with the uncompressed size leads the
/// compressed object instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHeader {
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Full mode including the file type bits.
    pub mode: u32,
    /// Device number; always zero today.
    pub rdev: u32,
    /// Symlink target; empty for regular files.
    pub symlink_target: String,
    /// Extended attributes.
    pub xattrs: XattrList,
}

impl FileHeader {
    /// Whether this header describes a symlink.
    pub fn is_symlink(&self) -> bool {
        (self.mode & libc::S_IFMT) == libc::S_IFLNK
    }

    /// Serialize the plain (content stream) header.
    pub fn to_bytes(&self) -> Vec<u8> {
        gvfmt::serialize_tuple(vec![
            Member::fixed(self.uid.to_be_bytes().to_vec(), 4),
            Member::fixed(self.gid.to_be_bytes().to_vec(), 4),
            Member::fixed(self.mode.to_be_bytes().to_vec(), 4),
            Member::fixed(self.rdev.to_be_bytes().to_vec(), 4),
            Member::variable(serialize_string(&self.symlink_target), 1),
            Member::variable(serialize_xattrs(&self.xattrs), 1),
        ])
    }

    /// Parse the plain header.
    pub fn from_bytes(d: &[u8]) -> Result<Self> {
        let mut t = TupleReader::new(d, 1);
        let uid = u32::from_be_bytes(t.fixed(4, 4)?.try_into().unwrap());
        let gid = u32::from_be_bytes(t.fixed(4, 4)?.try_into().unwrap());
        let mode = u32::from_be_bytes(t.fixed(4, 4)?.try_into().unwrap());
        let rdev = u32::from_be_bytes(t.fixed(4, 4)?.try_into().unwrap());
        let symlink_target = parse_string(t.variable(1)?)?;
        let xattrs = parse_xattrs(t.last(1)?)?;
        Ok(Self {
            uid,
            gid,
            mode,
            rdev,
            symlink_target,
            xattrs,
        })
    }

    /// Serialize the archive header, which carries the uncompressed payload
    /// size ahead of the metadata.
    pub fn to_zlib_bytes(&self, size: u64) -> Vec<u8> {
        gvfmt::serialize_tuple(vec![
            Member::fixed(size.to_be_bytes().to_vec(), 8),
            Member::fixed(self.uid.to_be_bytes().to_vec(), 4),
            Member::fixed(self.gid.to_be_bytes().to_vec(), 4),
            Member::fixed(self.mode.to_be_bytes().to_vec(), 4),
            Member::fixed(self.rdev.to_be_bytes().to_vec(), 4),
            Member::variable(serialize_string(&self.symlink_target), 1),
            Member::variable(serialize_xattrs(&self.xattrs), 1),
        ])
    }

    /// Parse the archive header; returns the uncompressed size as well.
    pub fn from_zlib_bytes(d: &[u8]) -> Result<(u64, Self)> {
        let mut t = TupleReader::new(d, 1);
        let size = u64::from_be_bytes(t.fixed(8, 8)?.try_into().unwrap());
        let uid = u32::from_be_bytes(t.fixed(4, 4)?.try_into().unwrap());
        let gid = u32::from_be_bytes(t.fixed(4, 4)?.try_into().unwrap());
        let mode = u32::from_be_bytes(t.fixed(4, 4)?.try_into().unwrap());
        let rdev = u32::from_be_bytes(t.fixed(4, 4)?.try_into().unwrap());
        let symlink_target = parse_string(t.variable(1)?)?;
        let xattrs = parse_xattrs(t.last(1)?)?;
        Ok((
            size,
            Self {
                uid,
                gid,
                mode,
                rdev,
                symlink_target,
                xattrs,
            },
        ))
    }
}

/// One ref advertised by a summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRef {
    /// The commit the ref points at.
    pub checksum: Checksum,
    /// Size in bytes of the loose commit object.
    pub size: u64,
    /// Per-ref metadata, e.g. the commit timestamp.
    pub metadata: VariantDict,
}

/// The decoded form of a repository summary: an ordered ref list plus a
/// top-level metadata dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    /// Refs sorted lexicographically by name.
    pub refs: Vec<(String, SummaryRef)>,
    /// Top-level metadata.
    pub metadata: VariantDict,
}

fn serialize_summary_entry(name: &str, r: &SummaryRef) -> Vec<u8> {
    let inner = gvfmt::serialize_tuple(vec![
        Member::fixed(r.size.to_be_bytes().to_vec(), 8),
        Member::variable(checksum_member(&r.checksum), 1),
        Member::variable(gvfmt::serialize_dict(&r.metadata), 8),
    ]);
    gvfmt::serialize_tuple(vec![
        Member::variable(serialize_string(name), 1),
        Member::variable(inner, 8),
    ])
}

fn parse_summary_entry(d: &[u8]) -> Result<(String, SummaryRef)> {
    let mut t = TupleReader::new(d, 1);
    let name = parse_string(t.variable(1)?)?;
    let inner = t.last(8)?;
    let mut t = TupleReader::new(inner, 1);
    let size = u64::from_be_bytes(t.fixed(8, 8)?.try_into().unwrap());
    let checksum = Checksum::from_bytes(t.variable(1)?)?;
    let metadata = gvfmt::parse_dict(t.last(8)?)?;
    Ok((
        name,
        SummaryRef {
            checksum,
            size,
            metadata,
        },
    ))
}

pub(crate) fn serialize_ref_list(refs: &[(String, SummaryRef)]) -> Vec<u8> {
    let elems = refs
        .iter()
        .map(|(name, r)| serialize_summary_entry(name, r))
        .collect();
    serialize_var_array(elems, 8)
}

pub(crate) fn parse_ref_list(d: &[u8]) -> Result<Vec<(String, SummaryRef)>> {
    split_var_array(d, 8)?
        .into_iter()
        .map(parse_summary_entry)
        .collect()
}

impl Summary {
    /// Serialize to the canonical wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        gvfmt::serialize_tuple(vec![
            Member::variable(serialize_ref_list(&self.refs), 8),
            Member::variable(gvfmt::serialize_dict(&self.metadata), 8),
        ])
    }

    /// Parse the canonical wire form.
    pub fn from_bytes(d: &[u8]) -> Result<Self> {
        let mut t = TupleReader::new(d, 1);
        let refs = parse_ref_list(t.variable(8)?)?;
        let metadata = gvfmt::parse_dict(t.last(8)?)?;
        Ok(Self { refs, metadata })
    }
}
