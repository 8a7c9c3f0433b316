//! Regeneration of the `summary` file: the index of refs, static deltas
//! and collections that peers use to discover available content.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use tracing::debug;

use crate::checksum::Checksum;
use crate::error::{check_cancel, Cancellable};
use crate::gvfmt::{self, Member, Variant, VariantDict};
use crate::objects::{serialize_ref_list, Summary, SummaryRef};
use crate::objtype::ObjectType;
use crate::repo::Repo;

/// Per-ref metadata key: the commit timestamp as a big-endian u64.
pub const KEY_COMMIT_TIMESTAMP: &str = "ostree.commit.timestamp";
/// Top-level metadata key: mapping of delta names to superblock digests.
pub const KEY_STATIC_DELTAS: &str = "ostree.static-deltas";
/// Top-level metadata key: when the summary was generated.
pub const KEY_LAST_MODIFIED: &str = "ostree.summary.last-modified";
/// Top-level metadata key: this repository's collection id.
pub const KEY_COLLECTION_ID: &str = "ostree.summary.collection-id";
/// Top-level metadata key: refs grouped by foreign collection id.
pub const KEY_COLLECTION_MAP: &str = "ostree.summary.collection-map";

const COLLECTION_MAP_TYPE: &str = "a{sa(s(taya{sv}))}";
const SUPERBLOCK: &str = "superblock";

/// The modified base64 used in static delta directory names: standard
/// base64 with `/` swapped for `_` and the padding dropped.
fn checksum_to_b64(checksum: &Checksum) -> String {
    let encoded = openssl::base64::encode_block(checksum.as_bytes());
    encoded.trim_end_matches('=').replace('/', "_")
}

fn checksum_from_b64(s: &str) -> Result<Checksum> {
    if s.len() != 43 {
        bail!("Invalid base64 checksum '{s}'");
    }
    let padded = format!("{}=", s.replace('_', "/"));
    let bytes = openssl::base64::decode_block(&padded)
        .with_context(|| format!("Invalid base64 checksum '{s}'"))?;
    let bytes = bytes
        .get(..32)
        .ok_or_else(|| anyhow::anyhow!("Invalid base64 checksum '{s}'"))?;
    Checksum::from_bytes(bytes)
}

/// Recover the delta name (`<to>` or `<from>-<to>` in hex) from the
/// two-level directory name under `deltas/`.
fn delta_name_from_mangled(mangled: &str) -> Result<String> {
    let parts: Vec<&str> = mangled.split('-').collect();
    match parts.as_slice() {
        [to] => Ok(checksum_from_b64(to)?.to_hex()),
        [from, to] => Ok(format!(
            "{}-{}",
            checksum_from_b64(from)?,
            checksum_from_b64(to)?
        )),
        _ => bail!("Invalid delta directory name '{mangled}'"),
    }
}

/// Enumerate static deltas, digesting each superblock.
fn list_static_deltas(
    repo: &Repo,
    cancellable: Option<&Cancellable>,
) -> Result<BTreeMap<String, Checksum>> {
    let mut out = BTreeMap::new();
    let Some(deltas) = repo.dir().open_dir_optional(crate::DELTAS_DIR)? else {
        return Ok(out);
    };
    for entry in deltas.entries()? {
        let entry = entry?;
        let Ok(prefix) = entry.file_name().into_string() else {
            continue;
        };
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let subdir = deltas.open_dir(&prefix)?;
        for entry in subdir.entries()? {
            check_cancel(cancellable)?;
            let entry = entry?;
            let Ok(rest) = entry.file_name().into_string() else {
                continue;
            };
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let sb_path = format!("{rest}/{SUPERBLOCK}");
            if !subdir.try_exists(&sb_path)? {
                continue;
            }
            let name = delta_name_from_mangled(&format!("{prefix}{rest}"))
                .with_context(|| format!("Parsing delta directory {prefix}/{rest}"))?;
            let mut data = Vec::new();
            subdir
                .open(&sb_path)?
                .read_to_end(&mut data)
                .with_context(|| format!("Reading {sb_path}"))?;
            out.insert(name, Checksum::digest(&data)?);
        }
    }
    Ok(out)
}

fn summary_ref_for(repo: &Repo, checksum: &Checksum) -> Result<SummaryRef> {
    let size = repo.query_object_size(ObjectType::Commit, checksum)?;
    let commit = repo.load_commit(checksum)?;
    let mut metadata = VariantDict::new();
    metadata.insert(
        KEY_COMMIT_TIMESTAMP.to_string(),
        Variant::Uint64(commit.timestamp),
    );
    Ok(SummaryRef {
        checksum: *checksum,
        size,
        metadata,
    })
}

fn serialize_collection_map(map: &BTreeMap<String, Vec<(String, SummaryRef)>>) -> Vec<u8> {
    let elems = map
        .iter()
        .map(|(cid, refs)| {
            gvfmt::serialize_tuple(vec![
                Member::variable(gvfmt::serialize_string(cid), 1),
                Member::variable(serialize_ref_list(refs), 8),
            ])
        })
        .collect();
    gvfmt::serialize_var_array(elems, 8)
}

/// Rebuild the `summary` file from the current refs and deltas, and drop
/// any stale detached signature.
///
/// Only local (heads) refs are advertised in the main list; mirrored
/// collection refs are grouped under the collection map, except for those
/// of this repository's own collection, which stay in the main list for
/// compatibility with peers that predate collections.
#[context("Regenerating summary")]
pub fn regenerate_summary(repo: &Repo, cancellable: Option<&Cancellable>) -> Result<()> {
    repo.ensure_writable()?;
    let mut refs = Vec::new();
    for (name, checksum) in repo.list_refs()? {
        check_cancel(cancellable)?;
        let entry = summary_ref_for(repo, &checksum)
            .with_context(|| format!("Processing ref {name}"))?;
        refs.push((name, entry));
    }

    let mut metadata = VariantDict::new();
    let deltas = list_static_deltas(repo, cancellable)?;
    let mut delta_dict = VariantDict::new();
    for (name, digest) in deltas {
        delta_dict.insert(name, Variant::Bytes(digest.as_bytes().to_vec()));
    }
    metadata.insert(KEY_STATIC_DELTAS.to_string(), Variant::Dict(delta_dict));

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    metadata.insert(KEY_LAST_MODIFIED.to_string(), Variant::Uint64(now));

    if let Some(collection_id) = repo.config().collection_id.as_deref() {
        metadata.insert(
            KEY_COLLECTION_ID.to_string(),
            Variant::String(collection_id.to_string()),
        );
        let mut map: BTreeMap<String, Vec<(String, SummaryRef)>> = BTreeMap::new();
        for (cid, collection_refs) in repo.list_collection_refs()? {
            if cid == collection_id {
                // Our own collection's refs are already the main list.
                continue;
            }
            let mut entries = Vec::new();
            for (name, checksum) in collection_refs {
                check_cancel(cancellable)?;
                let entry = summary_ref_for(repo, &checksum)
                    .with_context(|| format!("Processing collection ref {cid}:{name}"))?;
                entries.push((name, entry));
            }
            map.insert(cid, entries);
        }
        metadata.insert(
            KEY_COLLECTION_MAP.to_string(),
            Variant::Other(COLLECTION_MAP_TYPE.to_string(), serialize_collection_map(&map)),
        );
    }

    let summary = Summary { refs, metadata };
    repo.dir()
        .atomic_write(crate::SUMMARY_FILE, &summary.to_bytes())
        .context("Writing summary")?;
    repo.dir().remove_file_optional(crate::SUMMARY_SIG_FILE)?;
    debug!("Regenerated summary with {} refs", summary.refs.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_b64_roundtrip() {
        let c = Checksum::from_bytes(&[0xfe; 32]).unwrap();
        let b64 = checksum_to_b64(&c);
        assert_eq!(b64.len(), 43);
        assert!(!b64.contains('/'));
        assert!(!b64.contains('='));
        assert_eq!(checksum_from_b64(&b64).unwrap(), c);
    }

    #[test]
    fn test_delta_name_from_mangled() {
        let from = Checksum::from_bytes(&[1; 32]).unwrap();
        let to = Checksum::from_bytes(&[2; 32]).unwrap();
        let single = delta_name_from_mangled(&checksum_to_b64(&to)).unwrap();
        assert_eq!(single, to.to_hex());
        let pair =
            delta_name_from_mangled(&format!("{}-{}", checksum_to_b64(&from), checksum_to_b64(&to)))
                .unwrap();
        assert_eq!(pair, format!("{from}-{to}"));
        assert!(delta_name_from_mangled("garbage").is_err());
    }
}
