//! Detached signatures over commits and the summary.
//!
//! Signature packets live in the commit's detached metadata object under
//! [`KEY_GPG_SIGS`]; the summary's live in `summary.sig` with the same
//! schema.  The OpenPGP engine itself is an external collaborator plugged
//! in through [`GpgEngine`]; this module owns packet-list maintenance and
//! the composition of keyrings for verification.

use std::path::{Path, PathBuf};
use std::sync::Once;

use anyhow::{anyhow, bail, Context, Result};
use fn_error_context::context;
use once_cell::sync::OnceCell;

use crate::checksum::Checksum;
use crate::error::{is_not_found, Error};
use crate::gvfmt::{self, Variant, VariantDict};
use crate::objtype::ObjectType;
use crate::repo::Repo;

/// The detached-metadata key holding the list of signature packets (`aay`).
pub const KEY_GPG_SIGS: &str = "ostree.gpgsigs";

/// Sentinel remote name requesting the union of every remote's keyring.
pub const ALL_REMOTES: &str = "__all__";

/// System-wide keyring directory trusted for every remote.
const GLOBAL_KEYRING_DIR: &str = "/usr/share/ostree/trusted.gpg.d";

/// One source of public keys for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyringSource {
    /// A binary keyring file.
    File(PathBuf),
    /// A directory of keyring files.
    Directory(PathBuf),
}

/// The interface to the external OpenPGP engine.
pub trait GpgEngine: Send + Sync {
    /// Process-global engine initialization; invoked exactly once, lazily,
    /// before the first sign or verify.
    fn initialize(&self) {}

    /// Produce a detached signature packet over `data` with the given key.
    fn sign(&self, data: &[u8], key_id: &str) -> Result<Vec<u8>>;

    /// Report the signing key id of a detached signature packet.
    fn key_id_of_packet(&self, packet: &[u8]) -> Result<String>;

    /// Verify concatenated signature packets over `data` against the given
    /// keyrings, returning how many signatures were valid.
    fn verify(&self, data: &[u8], signatures: &[u8], keyrings: &[KeyringSource]) -> Result<usize>;
}

static GPG_ENGINE: OnceCell<Box<dyn GpgEngine>> = OnceCell::new();
static GPG_INIT: Once = Once::new();

/// Register the process-wide OpenPGP engine.  May be called once.
pub fn set_gpg_engine(engine: Box<dyn GpgEngine>) -> Result<()> {
    GPG_ENGINE
        .set(engine)
        .map_err(|_| anyhow!("A GPG engine is already registered"))
}

fn engine() -> Result<&'static dyn GpgEngine> {
    let engine = GPG_ENGINE
        .get()
        .ok_or_else(|| Error::Unsupported("no GPG engine is registered".into()))?;
    GPG_INIT.call_once(|| engine.initialize());
    Ok(engine.as_ref())
}

fn signature_list(meta: &VariantDict) -> Result<Vec<Vec<u8>>> {
    match meta.get(KEY_GPG_SIGS) {
        None => Ok(Vec::new()),
        Some(Variant::ByteArrays(sigs)) => Ok(sigs.clone()),
        Some(o) => bail!("Invalid {KEY_GPG_SIGS} of type {}", o.type_string()),
    }
}

/// Concatenate packets; OpenPGP packet framing is self-delimiting, so the
/// verifier can walk the stream without separators.
fn concat_signatures(sigs: &[Vec<u8>]) -> Vec<u8> {
    sigs.concat()
}

impl Repo {
    /// Append a detached signature over the commit into its detached
    /// metadata, rejecting a duplicate signature from the same key.
    #[context("Signing commit {checksum}")]
    pub fn sign_commit(&self, checksum: &Checksum, key_id: &str) -> Result<()> {
        let engine = engine()?;
        let commit = self.load_metadata(ObjectType::Commit, checksum)?;
        let mut meta = match self.load_commit_meta(checksum) {
            Ok(meta) => meta,
            Err(e) if is_not_found(&e) => VariantDict::new(),
            Err(e) => return Err(e),
        };
        let mut sigs = signature_list(&meta)?;
        for packet in &sigs {
            if engine.key_id_of_packet(packet)? == key_id {
                return Err(
                    Error::AlreadyExists(format!("Signature from key \"{key_id}\"")).into(),
                );
            }
        }
        sigs.push(engine.sign(&commit, key_id)?);
        meta.insert(KEY_GPG_SIGS.to_string(), Variant::ByteArrays(sigs));
        self.write_commit_detached_metadata(checksum, Some(&meta))
    }

    /// Verify the commit's detached signatures.  Returns the number of
    /// valid signatures (at least one, or this errors).
    #[context("Verifying commit {checksum}")]
    pub fn verify_commit(
        &self,
        checksum: &Checksum,
        remote: Option<&str>,
        override_keyring_dir: Option<&Path>,
        extra_keyring: Option<&Path>,
    ) -> Result<usize> {
        let engine = engine()?;
        let commit = self.load_metadata(ObjectType::Commit, checksum)?;
        let meta = self
            .load_commit_meta(checksum)
            .context("No detached metadata; commit is unsigned")?;
        let sigs = signature_list(&meta)?;
        if sigs.is_empty() {
            bail!("Commit {checksum} carries no signatures");
        }
        let keyrings =
            self.verification_keyrings(remote, override_keyring_dir, extra_keyring)?;
        let valid = engine.verify(&commit, &concat_signatures(&sigs), &keyrings)?;
        if valid == 0 {
            bail!("No valid signatures on commit {checksum}");
        }
        Ok(valid)
    }

    /// Sign the current summary, appending to `summary.sig`.
    #[context("Signing summary")]
    pub fn sign_summary(&self, key_id: &str) -> Result<()> {
        use cap_std_ext::dirext::CapStdExtDirExt;
        let engine = engine()?;
        let mut summary = Vec::new();
        {
            use std::io::Read;
            let mut f = self
                .dir()
                .open(crate::SUMMARY_FILE)
                .context("No summary file; regenerate it first")?;
            f.read_to_end(&mut summary)?;
        }
        let mut meta = match self.dir().open_optional(crate::SUMMARY_SIG_FILE)? {
            Some(mut f) => {
                use std::io::Read;
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                gvfmt::parse_dict(&buf).context("Parsing summary.sig")?
            }
            None => VariantDict::new(),
        };
        let mut sigs = signature_list(&meta)?;
        for packet in &sigs {
            if engine.key_id_of_packet(packet)? == key_id {
                return Err(
                    Error::AlreadyExists(format!("Signature from key \"{key_id}\"")).into(),
                );
            }
        }
        sigs.push(engine.sign(&summary, key_id)?);
        meta.insert(KEY_GPG_SIGS.to_string(), Variant::ByteArrays(sigs));
        self.dir()
            .atomic_write(crate::SUMMARY_SIG_FILE, &gvfmt::serialize_dict(&meta))
            .context("Writing summary.sig")?;
        Ok(())
    }

    /// Locate the keyring file for a remote: beside the repository, then in
    /// the remotes drop-in directory, then up the parent chain.
    pub(crate) fn find_remote_keyring(&self, name: &str) -> Result<Option<PathBuf>> {
        let filename = format!("{name}.trustedkeys.gpg");
        if self.dir().try_exists(&filename)? {
            return Ok(Some(self.path().join(&filename)));
        }
        if let Some(dir) = &self.remotes_config_dir {
            let candidate = dir.join(&filename);
            if candidate.exists() {
                return Ok(Some(candidate));
            }
        }
        match self.parent() {
            Some(parent) => parent.find_remote_keyring(name),
            None => Ok(None),
        }
    }

    /// Compose the keyring set used for verification.
    fn verification_keyrings(
        &self,
        remote: Option<&str>,
        override_keyring_dir: Option<&Path>,
        extra_keyring: Option<&Path>,
    ) -> Result<Vec<KeyringSource>> {
        let mut out = Vec::new();
        match remote {
            Some(ALL_REMOTES) => {
                for name in self.remote_list() {
                    if let Some(path) = self.find_remote_keyring(&name)? {
                        out.push(KeyringSource::File(path));
                    }
                }
            }
            Some(name) => {
                if let Some(path) = self.find_remote_keyring(name)? {
                    out.push(KeyringSource::File(path));
                }
                if self.has_remote(name) {
                    for path in self.remote_get_option_list(name, "gpgkeypath")? {
                        out.push(KeyringSource::File(PathBuf::from(path)));
                    }
                }
            }
            None => (),
        }
        match override_keyring_dir {
            Some(dir) => out.push(KeyringSource::Directory(dir.to_path_buf())),
            None => {
                let global = Path::new(GLOBAL_KEYRING_DIR);
                if global.is_dir() {
                    out.push(KeyringSource::Directory(global.to_path_buf()));
                }
            }
        }
        if let Some(extra) = extra_keyring {
            out.push(KeyringSource::File(extra.to_path_buf()));
        }
        Ok(out)
    }
}
