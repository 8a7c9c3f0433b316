//! Object types and the loose on-disk layout.

use std::fmt;

use anyhow::{anyhow, Result};
use camino::Utf8PathBuf;

use crate::checksum::Checksum;
use crate::config::StorageMode;

/// The kinds of content-addressed objects a repository stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectType {
    /// Regular file or symlink content plus metadata.
    File,
    /// A directory listing: names mapped to child objects.
    DirTree,
    /// Ownership, mode and xattrs for a directory node.
    DirMeta,
    /// Root pointer, parent, subject/body, timestamp, metadata.
    Commit,
    /// Marker recording the prior existence of a deleted commit.
    TombstoneCommit,
    /// Detached metadata and signatures for a commit.
    CommitMeta,
}

impl ObjectType {
    /// The type tag used in object names and loose file extensions.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::File => "file",
            ObjectType::DirTree => "dirtree",
            ObjectType::DirMeta => "dirmeta",
            ObjectType::Commit => "commit",
            ObjectType::TombstoneCommit => "tombstone-commit",
            ObjectType::CommitMeta => "commitmeta",
        }
    }

    /// Inverse of [`Self::as_str`]; `None` for unknown tags.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "file" => ObjectType::File,
            "dirtree" => ObjectType::DirTree,
            "dirmeta" => ObjectType::DirMeta,
            "commit" => ObjectType::Commit,
            "tombstone-commit" => ObjectType::TombstoneCommit,
            "commitmeta" => ObjectType::CommitMeta,
            _ => return None,
        })
    }

    /// Whether this object is serialized metadata (identical bytes in every
    /// storage mode) as opposed to file content.
    pub fn is_meta(&self) -> bool {
        !matches!(self, ObjectType::File)
    }

    /// The loose-file extension in the given storage mode.  File content is
    /// stored compressed (`filez`) in archive repositories and raw otherwise;
    /// metadata never varies.
    pub fn loose_extension(&self, mode: StorageMode) -> &'static str {
        match (self, mode) {
            (ObjectType::File, StorageMode::Archive) => "filez",
            (o, _) => o.as_str(),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical (checksum, type) pair identifying one object.  Its display
/// form `<checksum>.<type>` is used as the key in enumeration results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectName {
    /// The content digest.
    pub checksum: Checksum,
    /// The object kind.
    pub objtype: ObjectType,
}

impl ObjectName {
    /// Pair a checksum with a type.
    pub fn new(checksum: Checksum, objtype: ObjectType) -> Self {
        Self { checksum, objtype }
    }

    /// Parse the `<checksum>.<type>` form.
    pub fn parse(s: &str) -> Result<Self> {
        let (csum, typestr) = s
            .split_once('.')
            .ok_or_else(|| anyhow!("Invalid object name {s}"))?;
        let objtype = ObjectType::from_str_opt(typestr)
            .ok_or_else(|| anyhow!("Invalid object type {typestr}"))?;
        Ok(Self::new(Checksum::from_hex(csum)?, objtype))
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.checksum, self.objtype)
    }
}

/// Compute the repository-relative path of a loose object:
/// `objects/<first 2 hex chars>/<remaining 62>.<ext>`.
pub fn loose_path(checksum: &Checksum, objtype: ObjectType, mode: StorageMode) -> Utf8PathBuf {
    let hexed = checksum.to_hex();
    let (first, rest) = hexed.split_at(2);
    format!(
        "{}/{}/{}.{}",
        crate::OBJECTS_DIR,
        first,
        rest,
        objtype.loose_extension(mode)
    )
    .into()
}

/// The objects/-relative form of [`loose_path`], for code already holding
/// the objects directory fd.
pub(crate) fn loose_path_in_objects(
    checksum: &Checksum,
    objtype: ObjectType,
    mode: StorageMode,
) -> Utf8PathBuf {
    let hexed = checksum.to_hex();
    let (first, rest) = hexed.split_at(2);
    format!("{}/{}.{}", first, rest, objtype.loose_extension(mode)).into()
}

/// The flat name used for an object while it sits in a transaction's
/// staging directory.
pub(crate) fn staged_name(checksum: &Checksum, objtype: ObjectType, mode: StorageMode) -> String {
    format!("{}.{}", checksum, objtype.loose_extension(mode))
}

/// Parse a loose file name `<62 hex>.<ext>` found under a two-nybble prefix
/// directory.  Returns `None` for foreign files.
pub(crate) fn parse_loose_name(prefix: &str, name: &str) -> Option<ObjectName> {
    let (stem, ext) = name.split_once('.')?;
    if stem.len() != 62 || !stem.is_ascii() {
        return None;
    }
    let objtype = match ext {
        "filez" => ObjectType::File,
        o => ObjectType::from_str_opt(o)?,
    };
    let checksum = Checksum::from_hex(&format!("{prefix}{stem}")).ok()?;
    Some(ObjectName::new(checksum, objtype))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSUM: &str = "d8e2d9d42f2aea4c91c3d9f4d4cfff46dbfce9905671de9ed232f0df29c2ef10";

    #[test]
    fn test_loose_path() {
        let c = Checksum::from_hex(CSUM).unwrap();
        assert_eq!(
            loose_path(&c, ObjectType::Commit, StorageMode::Archive).as_str(),
            format!("objects/d8/{}.commit", &CSUM[2..])
        );
        assert_eq!(
            loose_path(&c, ObjectType::File, StorageMode::Archive).as_str(),
            format!("objects/d8/{}.filez", &CSUM[2..])
        );
        assert_eq!(
            loose_path(&c, ObjectType::File, StorageMode::BareUser).as_str(),
            format!("objects/d8/{}.file", &CSUM[2..])
        );
    }

    #[test]
    fn test_parse_loose_name() {
        let n = parse_loose_name("d8", &format!("{}.dirtree", &CSUM[2..])).unwrap();
        assert_eq!(n.checksum.to_hex(), CSUM);
        assert_eq!(n.objtype, ObjectType::DirTree);
        // filez maps back to a plain file object
        let n = parse_loose_name("d8", &format!("{}.filez", &CSUM[2..])).unwrap();
        assert_eq!(n.objtype, ObjectType::File);
        assert!(parse_loose_name("d8", "short.commit").is_none());
        assert!(parse_loose_name("d8", &format!("{}.blob", &CSUM[2..])).is_none());
    }

    #[test]
    fn test_object_name_roundtrip() {
        let c = Checksum::from_hex(CSUM).unwrap();
        let n = ObjectName::new(c, ObjectType::TombstoneCommit);
        let s = n.to_string();
        assert_eq!(s, format!("{CSUM}.tombstone-commit"));
        assert_eq!(ObjectName::parse(&s).unwrap(), n);
    }
}
