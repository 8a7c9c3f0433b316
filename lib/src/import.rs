//! Cross-repository object transfer: hardlink when safe, copy otherwise.

use std::io::Read;

use anyhow::{Context, Result};
use fn_error_context::context;
use tracing::debug;

use crate::checksum::Checksum;
use crate::config::StorageMode;
use crate::content::read_framed_header;
use crate::error::{check_cancel, Cancellable};
use crate::objects::FileHeader;
use crate::objtype::{loose_path_in_objects, ObjectType};
use crate::repo::Repo;

/// Whether the object may be transferred by hardlinking the loose file.
///
/// Metadata objects serialize identically in every mode; content objects
/// require equal modes, with one exception: a bare-user regular file can be
/// linked into a bare-user-only repository, because only symlinks are
/// represented differently between those two modes.
fn hardlink_preconditions(
    dest: &Repo,
    source: &Repo,
    objtype: ObjectType,
    checksum: &Checksum,
) -> Result<bool> {
    if dest.owner_uid() != source.owner_uid() {
        return Ok(false);
    }
    if objtype.is_meta() {
        return Ok(true);
    }
    if source.mode() == dest.mode() {
        return Ok(true);
    }
    if source.mode() == StorageMode::BareUser && dest.mode() == StorageMode::BareUserOnly {
        let (_, info, _) = source.load_file(checksum)?;
        let is_symlink = (info.mode & libc::S_IFMT) == libc::S_IFLNK;
        return Ok(!is_symlink);
    }
    Ok(false)
}

/// Attempt the link.  `Ok(true)` means the object is in place (including
/// the already-imported case); `Ok(false)` requests the copy fallback.
fn try_hardlink(
    dest: &Repo,
    source: &Repo,
    objtype: ObjectType,
    checksum: &Checksum,
) -> Result<bool> {
    let src_path = loose_path_in_objects(checksum, objtype, source.mode());
    let dest_path = loose_path_in_objects(checksum, objtype, dest.mode());
    let (prefix, _) = dest_path.as_str().split_at(2);
    match dest.objects().create_dir(prefix) {
        Ok(()) => (),
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => (),
        Err(e) => return Err(e).context("Creating object prefix directory"),
    }
    match source
        .objects()
        .hard_link(src_path.as_str(), dest.objects(), dest_path.as_str())
    {
        Ok(()) => Ok(true),
        Err(e) => match e.raw_os_error() {
            // Raced with another importer; the content is identical.
            Some(libc::EEXIST) => Ok(true),
            // Link limits, filesystem boundaries, permission policy:
            // copy instead.
            Some(libc::EMLINK) | Some(libc::EXDEV) | Some(libc::EPERM) => {
                debug!("Hardlink of {checksum}.{objtype} failed ({e}), copying");
                Ok(false)
            }
            _ => Err(e).with_context(|| format!("Hardlinking {checksum}.{objtype}")),
        },
    }
}

fn copy_object(
    dest: &Repo,
    source: &Repo,
    objtype: ObjectType,
    checksum: &Checksum,
    trusted: bool,
) -> Result<()> {
    if objtype.is_meta() {
        let bytes = source.load_metadata(objtype, checksum)?;
        if trusted {
            dest.write_metadata_trusted(objtype, checksum, &bytes)?;
        } else {
            // The validating path recomputes the digest and refuses a
            // mismatch against the advertised checksum.
            dest.write_metadata(objtype, Some(checksum), &bytes)?;
        }
        return Ok(());
    }
    let (mut stream, _size) = source.load_object_stream(objtype, checksum)?;
    let header = read_framed_header(&mut stream)?;
    let header = FileHeader::from_bytes(&header).context("Parsing content header")?;
    let mut payload = Vec::new();
    stream.read_to_end(&mut payload)?;
    if trusted {
        dest.write_content_trusted(checksum, &header, &payload)?;
    } else {
        dest.write_content(Some(checksum), &header, &payload)?;
    }
    Ok(())
}

/// Import one object from `source` into `dest`.
///
/// With `trusted` set and compatible repositories the transfer is a
/// hardlink; otherwise the object is streamed through the validating write
/// path, which re-hashes the content and fails on mismatch.  Importing a
/// commit also imports its detached metadata when present.
#[context("Importing {objtype} object {checksum}")]
pub fn import_object(
    dest: &Repo,
    source: &Repo,
    objtype: ObjectType,
    checksum: &Checksum,
    trusted: bool,
    cancellable: Option<&Cancellable>,
) -> Result<()> {
    check_cancel(cancellable)?;
    dest.ensure_writable()?;
    let mut done = false;
    if trusted && hardlink_preconditions(dest, source, objtype, checksum)? {
        done = try_hardlink(dest, source, objtype, checksum)?;
    }
    if !done && dest.has_object(objtype, checksum)? {
        done = true;
    }
    if !done {
        copy_object(dest, source, objtype, checksum, trusted)?;
    }
    if objtype == ObjectType::Commit && source.has_object(ObjectType::CommitMeta, checksum)? {
        import_object(
            dest,
            source,
            ObjectType::CommitMeta,
            checksum,
            trusted,
            cancellable,
        )?;
    }
    Ok(())
}
