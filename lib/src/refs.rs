//! Minimal file-backed access to the ref store.
//!
//! Just enough to resolve refs and enumerate them for summary generation;
//! the transactional ref database is a separate concern layered above.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::checksum::Checksum;
use crate::error::Error;
use crate::repo::Repo;

fn walk_refs(d: &Dir, prefix: &str, out: &mut BTreeMap<String, Checksum>) -> Result<()> {
    for entry in d.entries()? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let full = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        if entry.file_type()?.is_dir() {
            walk_refs(&d.open_dir(&name)?, &full, out)?;
        } else {
            let contents = d
                .read_to_string(&name)
                .with_context(|| format!("Reading ref {full}"))?;
            let checksum = Checksum::from_hex(contents.trim())
                .with_context(|| format!("Parsing ref {full}"))?;
            out.insert(full, checksum);
        }
    }
    Ok(())
}

impl Repo {
    /// Enumerate local (heads) refs, mapped to the commits they name.
    pub fn list_refs(&self) -> Result<BTreeMap<String, Checksum>> {
        let mut out = BTreeMap::new();
        if let Some(d) = self.dir().open_dir_optional(crate::REFS_HEADS_DIR)? {
            walk_refs(&d, "", &mut out)?;
        }
        Ok(out)
    }

    /// Resolve a local ref to a commit checksum, consulting the parent
    /// repository on miss.
    pub fn resolve_rev(&self, refspec: &str) -> Result<Checksum> {
        let path = Utf8Path::new(crate::REFS_HEADS_DIR).join(refspec);
        match self.dir().open_optional(&path)? {
            Some(_) => {
                let contents = self.dir().read_to_string(&path)?;
                Checksum::from_hex(contents.trim())
                    .with_context(|| format!("Parsing ref {refspec}"))
            }
            None => match self.parent() {
                Some(parent) => parent.resolve_rev(refspec),
                None => Err(Error::RefNotFound(refspec.to_string()).into()),
            },
        }
    }

    /// Point a local ref at a commit, creating intermediate directories.
    pub fn write_ref(&self, refspec: &str, checksum: &Checksum) -> Result<()> {
        self.ensure_writable()?;
        let path = Utf8Path::new(crate::REFS_HEADS_DIR).join(refspec);
        if let Some(parent) = path.parent() {
            self.dir().create_dir_all(parent)?;
        }
        self.dir()
            .atomic_write(&path, format!("{checksum}\n").as_bytes())
            .with_context(|| format!("Writing ref {refspec}"))?;
        Ok(())
    }

    /// Enumerate mirrored collection refs, grouped by collection id.
    pub(crate) fn list_collection_refs(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<String, Checksum>>> {
        let mut out = BTreeMap::new();
        let Some(d) = self.dir().open_dir_optional(crate::REFS_MIRRORS_DIR)? else {
            return Ok(out);
        };
        for entry in d.entries()? {
            let entry = entry?;
            let Ok(collection_id) = entry.file_name().into_string() else {
                continue;
            };
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let mut refs = BTreeMap::new();
            walk_refs(&d.open_dir(&collection_id)?, "", &mut refs)?;
            out.insert(collection_id, refs);
        }
        Ok(out)
    }
}
