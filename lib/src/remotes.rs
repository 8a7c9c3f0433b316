//! The registry of remote repository configurations.
//!
//! Remotes come from two places: `[remote "<name>"]` sections in the main
//! config, and per-remote drop-in files in a sysroot-aware directory
//! (normally `<sysroot>/etc/ostree/remotes.d/<name>.conf`).  A name defined
//! in both is a configuration error.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use tini::Ini;
use tracing::debug;

use crate::error::Error;
use crate::repo::Repo;

/// Keyfile-style string lists separate elements with semicolons.
const LIST_SEPARATOR: char = ';';

/// A named pointer to an external repository with per-remote options.
#[derive(Debug, Clone)]
pub struct Remote {
    name: String,
    options: BTreeMap<String, String>,
    /// The backing drop-in file, for remotes configured outside the main
    /// config.
    file: Option<PathBuf>,
}

impl Remote {
    /// The remote's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read a raw option value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// The configured URL, or the metalink URL if that is how the remote
    /// was added.
    pub fn url(&self) -> Option<&str> {
        self.get("url").or_else(|| self.get("metalink"))
    }

    /// The GPG keyring file name associated with this remote.
    pub fn keyring_filename(&self) -> String {
        format!("{}.trustedkeys.gpg", self.name)
    }

    pub(crate) fn group(name: &str) -> String {
        format!("remote \"{name}\"")
    }
}

fn parse_remote_group(section: &str) -> Option<String> {
    let inner = section.strip_prefix("remote \"")?.strip_suffix('"')?;
    if inner.is_empty() || inner.contains('"') {
        return None;
    }
    Some(inner.to_string())
}

pub(crate) fn validate_remote_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        anyhow::bail!("Invalid remote name '{name}'");
    }
    Ok(())
}

fn remotes_from_ini(
    ini: &Ini,
    file: Option<&Path>,
    out: &mut BTreeMap<String, Remote>,
) -> Result<()> {
    for (section, items) in ini.iter() {
        let Some(name) = parse_remote_group(section) else {
            continue;
        };
        let mut options = BTreeMap::new();
        for (k, v) in items.iter() {
            options.insert(k.clone(), v.clone());
        }
        let remote = Remote {
            name: name.clone(),
            options,
            file: file.map(Path::to_path_buf),
        };
        if out.insert(name.clone(), remote).is_some() {
            return Err(Error::InvalidConfig(format!(
                "Multiple configurations found for remote \"{name}\""
            ))
            .into());
        }
    }
    Ok(())
}

/// Gather remotes from the main config and the drop-in directory.
pub(crate) fn discover(
    config_text: &str,
    remotes_dir: Option<&Path>,
) -> Result<BTreeMap<String, Remote>> {
    let mut out = BTreeMap::new();
    let ini = Ini::from_string(config_text).context("Parsing repository config")?;
    remotes_from_ini(&ini, None, &mut out)?;
    let Some(dir) = remotes_dir else {
        return Ok(out);
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).with_context(|| format!("Reading {}", dir.display())),
    };
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("conf") {
            paths.push(path);
        }
    }
    paths.sort();
    for path in paths {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Reading {}", path.display()))?;
        let ini = Ini::from_string(&text)
            .with_context(|| format!("Parsing {}", path.display()))?;
        remotes_from_ini(&ini, Some(&path), &mut out)
            .with_context(|| format!("Processing {}", path.display()))?;
    }
    Ok(out)
}

fn parse_keyfile_boolean(s: &str) -> Result<bool> {
    match s.trim() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        o => Err(Error::InvalidConfig(format!("Invalid boolean value '{o}'")).into()),
    }
}

impl Repo {
    /// List configured remote names, merged with the parent repository's
    /// and sorted.
    pub fn remote_list(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.remotes.lock().unwrap().keys().cloned().collect();
        // The registry lock is released before descending the (acyclic)
        // parent chain, so at most one lock is held at a time.
        if let Some(parent) = self.parent() {
            names.extend(parent.remote_list());
        }
        names.into_iter().collect()
    }

    /// Whether the remote is configured here or anywhere up the chain.
    pub fn has_remote(&self, name: &str) -> bool {
        if self.remotes.lock().unwrap().contains_key(name) {
            return true;
        }
        self.parent().is_some_and(|p| p.has_remote(name))
    }

    /// Get a per-remote option.  A remote name of the form `file://...` is
    /// a pseudo-remote with no stored configuration: every getter returns
    /// the default.
    pub fn remote_get_option(
        &self,
        name: &str,
        key: &str,
        default: Option<&str>,
    ) -> Result<Option<String>> {
        if name.starts_with("file://") {
            return Ok(default.map(ToOwned::to_owned));
        }
        let local = {
            let remotes = self.remotes.lock().unwrap();
            match remotes.get(name) {
                Some(remote) => Some(remote.get(key).map(ToOwned::to_owned)),
                None => None,
            }
            // Lock dropped here; parent traversal below reacquires nothing
            // of ours.
        };
        match local {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => match self.parent() {
                Some(parent) if parent.has_remote(name) => {
                    parent.remote_get_option(name, key, default)
                }
                _ => Ok(default.map(ToOwned::to_owned)),
            },
            None => match self.parent() {
                Some(parent) => parent.remote_get_option(name, key, default),
                None => Err(Error::RemoteNotFound(name.to_string()).into()),
            },
        }
    }

    /// Boolean variant of [`Self::remote_get_option`].
    pub fn remote_get_option_bool(&self, name: &str, key: &str, default: bool) -> Result<bool> {
        match self.remote_get_option(name, key, None)? {
            None => Ok(default),
            Some(s) => parse_keyfile_boolean(&s)
                .with_context(|| format!("Remote \"{name}\" option {key}")),
        }
    }

    /// String-list variant of [`Self::remote_get_option`]; absent keys
    /// yield an empty list.
    pub fn remote_get_option_list(&self, name: &str, key: &str) -> Result<Vec<String>> {
        Ok(self
            .remote_get_option(name, key, None)?
            .map(|s| {
                s.split(LIST_SEPARATOR)
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Whether commit signatures must verify for this remote.  Implicitly
    /// disabled for `file://` pseudo-remotes.
    pub fn remote_get_gpg_verify(&self, name: &str) -> Result<bool> {
        if name.starts_with("file://") {
            return Ok(false);
        }
        self.remote_get_option_bool(name, "gpg-verify", true)
    }

    /// Add a remote.  The URL may carry a `metalink=` prefix, in which case
    /// it is stored under the `metalink` option.  Configuration goes to the
    /// drop-in directory when one is set up, else into the repo config.
    #[context("Adding remote {name}")]
    pub fn remote_add(
        &self,
        name: &str,
        url: &str,
        options: &[(&str, &str)],
        if_not_exists: bool,
    ) -> Result<()> {
        validate_remote_name(name)?;
        {
            let remotes = self.remotes.lock().unwrap();
            if remotes.contains_key(name) {
                if if_not_exists {
                    return Ok(());
                }
                return Err(Error::AlreadyExists(format!("Remote \"{name}\"")).into());
            }
        }
        let (url_key, url_value) = match url.strip_prefix("metalink=") {
            Some(m) => ("metalink", m),
            None => ("url", url),
        };
        let mut opts = BTreeMap::new();
        opts.insert(url_key.to_string(), url_value.to_string());
        for (k, v) in options {
            opts.insert((*k).to_string(), (*v).to_string());
        }
        let group = Remote::group(name);
        let file = match &self.remotes_config_dir {
            Some(dir) => {
                let mut ini = Ini::new().section(group.as_str());
                for (k, v) in &opts {
                    ini = ini.item(k.as_str(), v.as_str());
                }
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Creating {}", dir.display()))?;
                let path = dir.join(format!("{name}.conf"));
                std::fs::write(&path, ini.to_string())
                    .with_context(|| format!("Writing {}", path.display()))?;
                Some(path)
            }
            None => {
                self.rewrite_config(|text| {
                    let mut ini = Ini::from_string(text)
                        .context("Parsing repository config")?
                        .section(group.as_str());
                    for (k, v) in &opts {
                        ini = ini.item(k.as_str(), v.as_str());
                    }
                    Ok(ini.to_string())
                })?;
                None
            }
        };
        debug!("Added remote {name}");
        self.remotes.lock().unwrap().insert(
            name.to_string(),
            Remote {
                name: name.to_string(),
                options: opts,
                file,
            },
        );
        Ok(())
    }

    /// Delete a remote along with its keyring file.
    #[context("Deleting remote {name}")]
    pub fn remote_delete(&self, name: &str, if_exists: bool) -> Result<()> {
        validate_remote_name(name)?;
        let existing = self.remotes.lock().unwrap().get(name).cloned();
        let Some(remote) = existing else {
            if if_exists {
                return Ok(());
            }
            return Err(Error::RemoteNotFound(name.to_string()).into());
        };
        match &remote.file {
            Some(path) => match std::fs::remove_file(path) {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => {
                    return Err(e).with_context(|| format!("Removing {}", path.display()));
                }
            },
            None => {
                let group = Remote::group(name);
                self.rewrite_config(|text| {
                    let ini =
                        Ini::from_string(text).context("Parsing repository config")?;
                    let mut out = Ini::new();
                    for (section, items) in ini.iter() {
                        if *section == group {
                            continue;
                        }
                        out = out.section(section.as_str());
                        for (k, v) in items.iter() {
                            out = out.item(k.as_str(), v.as_str());
                        }
                    }
                    Ok(out.to_string())
                })?;
            }
        }
        self.dir().remove_file_optional(remote.keyring_filename())?;
        self.remotes.lock().unwrap().remove(name);
        debug!("Deleted remote {name}");
        Ok(())
    }
}
