//! Integration tests driving whole repositories on a real filesystem.

use std::io::Read;
use std::path::Path;

use anyhow::Result;
use ostree_repo::{
    import_object, is_not_found, loose_path, regenerate_summary, Checksum, Commit, DirMeta,
    DirTree, Error, FileHeader, GpgEngine, KeyringSource, ObjectType, Repo, StorageMode, Summary,
    Variant, VariantDict,
};

const TS: u64 = 1700000000;

fn tempdir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

fn regular_header(uid: u32, gid: u32, perms: u32) -> FileHeader {
    FileHeader {
        uid,
        gid,
        mode: libc::S_IFREG | perms,
        rdev: 0,
        symlink_target: String::new(),
        xattrs: Vec::new(),
    }
}

fn symlink_header(target: &str) -> FileHeader {
    FileHeader {
        uid: 0,
        gid: 0,
        mode: libc::S_IFLNK | 0o777,
        rdev: 0,
        symlink_target: target.to_string(),
        xattrs: Vec::new(),
    }
}

/// Write a minimal tree: one file, a root dirtree, a dirmeta, one commit.
fn write_sample_commit(repo: &Repo, subject: &str) -> Result<Checksum> {
    let content = repo.write_content(
        None,
        &regular_header(1000, 1000, 0o644),
        format!("content of {subject}\n").as_bytes(),
    )?;
    let dirmeta = DirMeta {
        uid: 0,
        gid: 0,
        mode: libc::S_IFDIR | 0o755,
        xattrs: Vec::new(),
    };
    let dirmeta_csum = repo.write_metadata(ObjectType::DirMeta, None, &dirmeta.to_bytes())?;
    let dirtree = DirTree {
        files: vec![("data".to_string(), content)],
        dirs: Vec::new(),
    };
    let dirtree_csum = repo.write_metadata(ObjectType::DirTree, None, &dirtree.to_bytes())?;
    let commit = Commit {
        metadata: VariantDict::new(),
        parent: None,
        related: Vec::new(),
        subject: subject.to_string(),
        body: String::new(),
        timestamp: TS,
        root_tree: dirtree_csum,
        root_meta: dirmeta_csum,
    };
    repo.write_metadata(ObjectType::Commit, None, &commit.to_bytes())
}

#[test]
fn test_create_write_read_bare_user() -> Result<()> {
    let td = tempdir();
    let repo = Repo::create(td.path(), StorageMode::BareUser)?;
    assert_eq!(repo.mode(), StorageMode::BareUser);
    assert!(repo.is_writable());

    let header = regular_header(1000, 1000, 0o644);
    let checksum = repo.write_content(None, &header, b"hello\n")?;
    assert!(repo.has_object(ObjectType::File, &checksum)?);

    let (payload, info, xattrs) = repo.load_file(&checksum)?;
    assert_eq!(info.uid, 1000);
    assert_eq!(info.gid, 1000);
    assert_eq!(info.mode, libc::S_IFREG | 0o644);
    assert!(xattrs.is_empty());
    match payload {
        ostree_repo::ContentPayload::Stream(s) => {
            assert_eq!(s.read_to_vec()?, b"hello\n");
        }
        o => panic!("Unexpected payload {o:?}"),
    }
    Ok(())
}

#[test]
fn test_content_addressing_is_stable() -> Result<()> {
    let td = tempdir();
    let repo = Repo::create(td.path(), StorageMode::BareUser)?;
    let header = regular_header(1000, 1000, 0o644);
    let first = repo.write_content(None, &header, b"hello\n")?;
    let second = repo.write_content(None, &header, b"hello\n")?;
    assert_eq!(first, second);

    // The canonical object stream re-hashes to the same checksum.
    let (mut stream, size) = repo.load_object_stream(ObjectType::File, &first)?;
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes)?;
    assert_eq!(bytes.len() as u64, size);
    assert_eq!(Checksum::digest(&bytes)?, first);
    Ok(())
}

#[test]
fn test_metadata_roundtrip_bytes() -> Result<()> {
    let td = tempdir();
    let repo = Repo::create(td.path(), StorageMode::Archive)?;
    let commit_csum = write_sample_commit(&repo, "roundtrip")?;
    let commit = repo.load_commit(&commit_csum)?;
    assert_eq!(commit.subject, "roundtrip");
    assert_eq!(commit.timestamp, TS);
    // Byte-for-byte: reserializing the parsed form reproduces the object.
    let raw = repo.load_metadata(ObjectType::Commit, &commit_csum)?;
    similar_asserts::assert_eq!(&commit.to_bytes()[..], &raw[..]);
    assert_eq!(Checksum::digest(&raw)?, commit_csum);

    let tree = repo.load_dirtree(&commit.root_tree)?;
    assert_eq!(tree.files.len(), 1);
    assert_eq!(tree.files[0].0, "data");
    Ok(())
}

#[test]
fn test_large_metadata_roundtrip() -> Result<()> {
    let td = tempdir();
    let repo = Repo::create(td.path(), StorageMode::BareUser)?;
    let files: Vec<(String, Checksum)> = (0..1000)
        .map(|i| {
            let csum = Checksum::digest(format!("{i}").as_bytes()).unwrap();
            (format!("file-{i:04}"), csum)
        })
        .collect();
    let tree = DirTree {
        files,
        dirs: Vec::new(),
    };
    let bytes = tree.to_bytes();
    // Big enough to take the memory-mapped read path.
    assert!(bytes.len() > 16 * 1024);
    let csum = repo.write_metadata(ObjectType::DirTree, None, &bytes)?;
    let loaded = repo.load_dirtree(&csum)?;
    assert_eq!(loaded, tree);

    // Exactly 16 KiB sits on the boundary and takes the buffered path;
    // the store never decodes here, so arbitrary bytes are fine.
    let boundary = vec![0xabu8; 16 * 1024];
    let csum = repo.write_metadata(ObjectType::DirTree, None, &boundary)?;
    let raw = repo.load_metadata(ObjectType::DirTree, &csum)?;
    assert_eq!(raw.len(), 16 * 1024);
    assert_eq!(&raw[..], &boundary[..]);
    Ok(())
}

#[test]
fn test_create_is_idempotent() -> Result<()> {
    let td = tempdir();
    let first = Repo::create(td.path(), StorageMode::Archive)?;
    assert_eq!(first.mode(), StorageMode::Archive);
    drop(first);
    // A second create, even with a different mode, retains the original.
    let second = Repo::create(td.path(), StorageMode::BareUser)?;
    assert_eq!(second.mode(), StorageMode::Archive);
    Ok(())
}

#[test]
fn test_archive_delete() -> Result<()> {
    let td = tempdir();
    let repo = Repo::create(td.path(), StorageMode::Archive)?;
    let checksum = repo.write_content(None, &regular_header(0, 0, 0o644), b"payload")?;
    assert!(repo.has_object(ObjectType::File, &checksum)?);
    let loose = td
        .path()
        .join(loose_path(&checksum, ObjectType::File, StorageMode::Archive).as_str());
    assert!(loose.exists());
    assert!(loose.extension().unwrap() == "filez");

    repo.delete_object(ObjectType::File, &checksum)?;
    assert!(!repo.has_object(ObjectType::File, &checksum)?);
    assert!(!loose.exists());

    // Deleting again reports the missing object.
    let e = repo.delete_object(ObjectType::File, &checksum).unwrap_err();
    assert!(is_not_found(&e), "{e}");
    Ok(())
}

#[test]
fn test_archive_symlink_roundtrip() -> Result<()> {
    let td = tempdir();
    let repo = Repo::create(td.path(), StorageMode::Archive)?;
    let checksum = repo.write_content(None, &symlink_header("../bin/sh"), b"")?;
    let (payload, info, _) = repo.load_file(&checksum)?;
    assert_eq!(info.mode & libc::S_IFMT, libc::S_IFLNK);
    match payload {
        ostree_repo::ContentPayload::Symlink(t) => assert_eq!(t, "../bin/sh"),
        o => panic!("Unexpected payload {o:?}"),
    }
    Ok(())
}

/// Append a key to the `[core]` section, which the initial config ends with.
fn append_core_key(repo_path: &Path, line: &str) -> Result<()> {
    let config = repo_path.join("config");
    let text = std::fs::read_to_string(&config)?;
    std::fs::write(&config, format!("{}\n{line}\n", text.trim_end()))?;
    Ok(())
}

fn set_child_parent(child_path: &Path, parent_path: &Path) -> Result<()> {
    append_core_key(child_path, &format!("parent = {}", parent_path.display()))
}

#[test]
fn test_parent_chain() -> Result<()> {
    let td = tempdir();
    let parent_path = td.path().join("parent");
    let child_path = td.path().join("child");
    let parent = Repo::create(&parent_path, StorageMode::BareUser)?;
    let commit_csum = write_sample_commit(&parent, "in-parent")?;
    drop(parent);

    let child = Repo::create(&child_path, StorageMode::BareUser)?;
    drop(child);
    set_child_parent(&child_path, &parent_path)?;
    let child = Repo::open(&child_path)?;
    assert!(child.parent().is_some());

    // Reads fall back to the parent...
    assert!(child.has_object(ObjectType::Commit, &commit_csum)?);
    let commit = child.load_commit(&commit_csum)?;
    assert_eq!(commit.subject, "in-parent");
    let tree = child.load_dirtree(&commit.root_tree)?;
    let (payload, _, _) = child.load_file(&tree.files[0].1)?;
    match payload {
        ostree_repo::ContentPayload::Stream(s) => {
            assert_eq!(s.read_to_vec()?, b"content of in-parent\n");
        }
        o => panic!("Unexpected payload {o:?}"),
    }

    // ...enumeration is the union of both stores...
    let flags = ostree_repo::ListObjectsFlags {
        loose: true,
        ..Default::default()
    };
    let both = child.list_objects(flags, None)?;
    let parent_only = child.parent().unwrap().list_objects(flags, None)?;
    assert_eq!(both, parent_only);
    let no_parents = ostree_repo::ListObjectsFlags {
        loose: true,
        no_parents: true,
        ..Default::default()
    };
    assert!(child.list_objects(no_parents, None)?.is_empty());

    // ...and deletion never reaches into the parent.
    let e = child
        .delete_object(ObjectType::Commit, &commit_csum)
        .unwrap_err();
    assert!(is_not_found(&e), "{e}");
    assert!(child.has_object(ObjectType::Commit, &commit_csum)?);
    Ok(())
}

#[test]
fn test_parent_cycle_detected() -> Result<()> {
    let td = tempdir();
    let a_path = td.path().join("a");
    let b_path = td.path().join("b");
    drop(Repo::create(&a_path, StorageMode::BareUser)?);
    drop(Repo::create(&b_path, StorageMode::BareUser)?);
    set_child_parent(&a_path, &b_path)?;
    set_child_parent(&b_path, &a_path)?;
    let e = Repo::open(&a_path).unwrap_err();
    assert!(format!("{e:#}").contains("cycle"), "{e:#}");
    Ok(())
}

#[test]
fn test_remote_add_list_delete() -> Result<()> {
    let td = tempdir();
    let repo = Repo::create(td.path(), StorageMode::Archive)?;
    repo.remote_add("a", "https://x/a", &[], false)?;
    repo.remote_add("b", "https://x/b", &[("gpg-verify", "false")], false)?;
    assert_eq!(repo.remote_list(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(
        repo.remote_get_option("a", "url", None)?.as_deref(),
        Some("https://x/a")
    );
    assert!(!repo.remote_get_option_bool("b", "gpg-verify", true)?);

    // Adding a present name is an error unless tolerated explicitly.
    let e = repo.remote_add("a", "https://y/a", &[], false).unwrap_err();
    assert!(format!("{e:#}").contains("already exists"), "{e:#}");
    repo.remote_add("a", "https://y/a", &[], true)?;
    assert_eq!(
        repo.remote_get_option("a", "url", None)?.as_deref(),
        Some("https://x/a")
    );

    // The registry survives a reopen (it is backed by the config file).
    drop(repo);
    let repo = Repo::open(td.path())?;
    assert_eq!(repo.remote_list(), vec!["a".to_string(), "b".to_string()]);

    repo.remote_delete("a", false)?;
    assert_eq!(repo.remote_list(), vec!["b".to_string()]);
    let e = repo.remote_delete("a", false).unwrap_err();
    assert!(is_not_found(&e), "{e}");
    repo.remote_delete("a", true)?;

    drop(repo);
    let repo = Repo::open(td.path())?;
    assert_eq!(repo.remote_list(), vec!["b".to_string()]);
    Ok(())
}

#[test]
fn test_remote_dropin_dir() -> Result<()> {
    let td = tempdir();
    let repo_path = td.path().join("repo");
    let remotes_dir = td.path().join("remotes.d");
    drop(Repo::create(&repo_path, StorageMode::Archive)?);
    let repo = Repo::open_with_remotes_dir(&repo_path, Some(remotes_dir.clone()))?;
    repo.remote_add("dropin", "metalink=https://x/metalink.xml", &[], false)?;
    assert!(remotes_dir.join("dropin.conf").exists());
    assert_eq!(
        repo.remote_get_option("dropin", "metalink", None)?.as_deref(),
        Some("https://x/metalink.xml")
    );
    assert_eq!(repo.remote_get_option("dropin", "url", None)?, None);

    // Visible again on reopen, through the drop-in directory.
    drop(repo);
    let repo = Repo::open_with_remotes_dir(&repo_path, Some(remotes_dir.clone()))?;
    assert_eq!(repo.remote_list(), vec!["dropin".to_string()]);
    repo.remote_delete("dropin", false)?;
    assert!(!remotes_dir.join("dropin.conf").exists());
    Ok(())
}

#[test]
fn test_remote_inheritance_and_pseudo() -> Result<()> {
    let td = tempdir();
    let parent_path = td.path().join("parent");
    let child_path = td.path().join("child");
    let parent = Repo::create(&parent_path, StorageMode::BareUser)?;
    parent.remote_add("origin", "https://x/os", &[("custom", "fromparent")], false)?;
    drop(parent);
    drop(Repo::create(&child_path, StorageMode::BareUser)?);
    set_child_parent(&child_path, &parent_path)?;
    let child = Repo::open(&child_path)?;

    // Absent locally: inherited from the parent.
    assert_eq!(
        child.remote_get_option("origin", "custom", None)?.as_deref(),
        Some("fromparent")
    );
    assert_eq!(child.remote_list(), vec!["origin".to_string()]);
    // Present locally: the parent is not consulted.
    child.remote_add("origin2", "https://x/other", &[("custom", "local")], false)?;
    assert_eq!(
        child.remote_get_option("origin2", "custom", None)?.as_deref(),
        Some("local")
    );
    // Unknown everywhere: an error, not a default.
    let e = child.remote_get_option("nope", "url", Some("d")).unwrap_err();
    assert!(is_not_found(&e), "{e}");

    // file:// pseudo-remotes short-circuit to defaults, gpg off.
    assert_eq!(
        child.remote_get_option("file:///srv/repo", "url", Some("dflt"))?,
        Some("dflt".to_string())
    );
    assert!(!child.remote_get_gpg_verify("file:///srv/repo")?);
    Ok(())
}

#[test]
fn test_tombstone_commits() -> Result<()> {
    let td = tempdir();
    let repo_path = td.path().join("repo");
    drop(Repo::create(&repo_path, StorageMode::BareUser)?);
    append_core_key(&repo_path, "tombstone-commits = true")?;
    let repo = Repo::open(&repo_path)?;

    let commit_csum = write_sample_commit(&repo, "doomed")?;
    repo.delete_object(ObjectType::Commit, &commit_csum)?;
    assert!(!repo.has_object(ObjectType::Commit, &commit_csum)?);
    assert!(repo.has_object(ObjectType::TombstoneCommit, &commit_csum)?);

    // Without the option, no tombstone is written.
    let plain_path = td.path().join("plain");
    let plain = Repo::create(&plain_path, StorageMode::BareUser)?;
    let c = write_sample_commit(&plain, "plain")?;
    plain.delete_object(ObjectType::Commit, &c)?;
    assert!(!plain.has_object(ObjectType::TombstoneCommit, &c)?);
    Ok(())
}

#[test]
fn test_transaction_staging() -> Result<()> {
    let td = tempdir();
    let repo = Repo::create(td.path(), StorageMode::BareUser)?;
    assert!(!repo.prepare_transaction()?);
    let dirmeta = DirMeta {
        uid: 0,
        gid: 0,
        mode: libc::S_IFDIR | 0o755,
        xattrs: Vec::new(),
    };
    let csum = repo.write_metadata(ObjectType::DirMeta, None, &dirmeta.to_bytes())?;

    // Our own writes are visible through the staging directory...
    assert!(repo.has_object(ObjectType::DirMeta, &csum)?);
    assert_eq!(*repo.load_dirmeta(&csum)?, dirmeta);
    // ...but nothing has reached objects/ yet.
    let loose = td
        .path()
        .join(loose_path(&csum, ObjectType::DirMeta, StorageMode::BareUser).as_str());
    assert!(!loose.exists());

    // Abandoning the transaction leaves objects/ untouched.
    repo.abort_transaction()?;
    assert!(!repo.has_object(ObjectType::DirMeta, &csum)?);
    assert!(!loose.exists());

    // A fresh transaction reuses the staging directory, and committing
    // publishes the previously staged write atomically.
    assert!(repo.prepare_transaction()?);
    assert!(repo.has_object(ObjectType::DirMeta, &csum)?);
    let stats = repo.commit_transaction(None)?;
    assert_eq!(stats.metadata_objects_written, 0);
    assert!(loose.exists());
    assert!(repo.has_object(ObjectType::DirMeta, &csum)?);
    assert!(!repo.in_transaction());
    Ok(())
}

#[test]
fn test_stale_staging_removed_after_boot_change() -> Result<()> {
    let td = tempdir();
    let repo = Repo::create(td.path(), StorageMode::BareUser)?;
    repo.prepare_transaction()?;
    let dirmeta = DirMeta {
        uid: 0,
        gid: 0,
        mode: libc::S_IFDIR | 0o755,
        xattrs: Vec::new(),
    };
    repo.write_metadata(ObjectType::DirMeta, None, &dirmeta.to_bytes())?;
    drop(repo);

    let staging_dirs = |root: &Path| -> Vec<String> {
        std::fs::read_dir(root.join("tmp"))
            .unwrap()
            .filter_map(|e| e.unwrap().file_name().into_string().ok())
            .filter(|n| n.starts_with("staging-") && !n.ends_with("-lock"))
            .collect()
    };
    assert_eq!(staging_dirs(td.path()).len(), 1);

    // Opening after a "reboot" discards the leftover staging directory,
    // since its contents may never have hit stable storage.
    std::env::set_var("OSTREE_BOOTID", "deadbeef-dead-beef-dead-beefdeadbeef");
    let reopened = Repo::open(td.path());
    std::env::remove_var("OSTREE_BOOTID");
    reopened?;
    assert!(staging_dirs(td.path()).is_empty());
    Ok(())
}

#[test]
fn test_import_hardlink_and_conversions() -> Result<()> {
    use std::os::unix::fs::MetadataExt;
    let td = tempdir();
    let src = Repo::create(td.path().join("src"), StorageMode::BareUser)?;
    let regular = src.write_content(None, &regular_header(1000, 1000, 0o644), b"shared")?;
    let link = src.write_content(None, &symlink_header("target"), b"")?;

    // Same mode, trusted: hardlinked.
    let same = Repo::create(td.path().join("same"), StorageMode::BareUser)?;
    import_object(&same, &src, ObjectType::File, &regular, true, None)?;
    let same_loose = td
        .path()
        .join("same")
        .join(loose_path(&regular, ObjectType::File, StorageMode::BareUser).as_str());
    assert_eq!(std::fs::metadata(&same_loose)?.nlink(), 2);

    // bare-user -> bare-user-only: regular files hardlink...
    let only = Repo::create(td.path().join("only"), StorageMode::BareUserOnly)?;
    import_object(&only, &src, ObjectType::File, &regular, true, None)?;
    let only_loose = |c: &Checksum| {
        td.path()
            .join("only")
            .join(loose_path(c, ObjectType::File, StorageMode::BareUserOnly).as_str())
    };
    assert_eq!(std::fs::metadata(only_loose(&regular))?.nlink(), 3);

    // ...but symlink objects are regular files on the bare-user side and
    // must be converted by copying.
    import_object(&only, &src, ObjectType::File, &link, true, None)?;
    let md = std::fs::symlink_metadata(only_loose(&link))?;
    assert!(md.file_type().is_symlink());
    assert_eq!(md.nlink(), 1);
    let (payload, _, _) = only.load_file(&link)?;
    match payload {
        ostree_repo::ContentPayload::Symlink(t) => assert_eq!(t, "target"),
        o => panic!("Unexpected payload {o:?}"),
    }

    // Differing modes with no conversion path: streamed copy.
    let archive = Repo::create(td.path().join("archive"), StorageMode::Archive)?;
    import_object(&archive, &src, ObjectType::File, &regular, true, None)?;
    let (payload, info, _) = archive.load_file(&regular)?;
    assert_eq!(info.uid, 1000);
    match payload {
        ostree_repo::ContentPayload::Stream(s) => assert_eq!(s.read_to_vec()?, b"shared"),
        o => panic!("Unexpected payload {o:?}"),
    }
    Ok(())
}

#[test]
fn test_import_commit_brings_detached_metadata() -> Result<()> {
    let td = tempdir();
    let src = Repo::create(td.path().join("src"), StorageMode::Archive)?;
    let commit_csum = write_sample_commit(&src, "signed-ish")?;
    let mut meta = VariantDict::new();
    meta.insert("xa.note".to_string(), Variant::String("hi".to_string()));
    src.write_commit_detached_metadata(&commit_csum, Some(&meta))?;

    let dst = Repo::create(td.path().join("dst"), StorageMode::Archive)?;
    // Import the full closure of the commit.
    let commit = src.load_commit(&commit_csum)?;
    let tree = src.load_dirtree(&commit.root_tree)?;
    import_object(&dst, &src, ObjectType::DirMeta, &commit.root_meta, true, None)?;
    import_object(&dst, &src, ObjectType::DirTree, &commit.root_tree, true, None)?;
    for (_, csum) in &tree.files {
        import_object(&dst, &src, ObjectType::File, csum, true, None)?;
    }
    import_object(&dst, &src, ObjectType::Commit, &commit_csum, true, None)?;
    assert!(dst.has_object(ObjectType::CommitMeta, &commit_csum)?);
    assert_eq!(
        dst.load_commit_meta(&commit_csum)?.get("xa.note"),
        Some(&Variant::String("hi".to_string()))
    );
    Ok(())
}

#[test]
fn test_untrusted_import_rejects_corruption() -> Result<()> {
    let td = tempdir();
    let src = Repo::create(td.path().join("src"), StorageMode::BareUser)?;
    let dirmeta = DirMeta {
        uid: 1,
        gid: 1,
        mode: libc::S_IFDIR | 0o700,
        xattrs: Vec::new(),
    };
    let csum = src.write_metadata(ObjectType::DirMeta, None, &dirmeta.to_bytes())?;
    // Corrupt the loose object behind the store's back.
    let loose = td
        .path()
        .join("src")
        .join(loose_path(&csum, ObjectType::DirMeta, StorageMode::BareUser).as_str());
    std::fs::write(&loose, DirMeta { uid: 2, ..dirmeta }.to_bytes())?;

    let dst = Repo::create(td.path().join("dst"), StorageMode::BareUser)?;
    let e = import_object(&dst, &src, ObjectType::DirMeta, &csum, false, None).unwrap_err();
    let msg = format!("{e:#}");
    assert!(msg.contains("checksum expected"), "{msg}");
    assert!(!dst.has_object(ObjectType::DirMeta, &csum)?);
    Ok(())
}

#[test]
fn test_dirmeta_cache_reservation() -> Result<()> {
    let td = tempdir();
    let repo = Repo::create(td.path(), StorageMode::BareUser)?;
    let dirmeta = DirMeta {
        uid: 0,
        gid: 0,
        mode: libc::S_IFDIR | 0o755,
        xattrs: Vec::new(),
    };
    let csum = repo.write_metadata(ObjectType::DirMeta, None, &dirmeta.to_bytes())?;

    {
        let _token = repo.dirmeta_cache_reservation();
        let first = repo.load_dirmeta(&csum)?;
        let second = repo.load_dirmeta(&csum)?;
        assert!(std::sync::Arc::ptr_eq(&first, &second));
    }
    // With no reservation, loads parse fresh copies.
    let first = repo.load_dirmeta(&csum)?;
    let second = repo.load_dirmeta(&csum)?;
    assert!(!std::sync::Arc::ptr_eq(&first, &second));
    Ok(())
}

#[test]
fn test_list_commits_with_prefix_and_size() -> Result<()> {
    let td = tempdir();
    let repo = Repo::create(td.path(), StorageMode::BareUser)?;
    let commit_csum = write_sample_commit(&repo, "listed")?;
    let hexed = commit_csum.to_hex();

    let matches = repo.list_commits_with_prefix(&hexed[..6])?;
    assert_eq!(matches.len(), 1);
    assert!(matches.keys().any(|n| n.checksum == commit_csum));
    assert!(repo.list_commits_with_prefix("0000000000")?.len() <= 1);

    let size = repo.query_object_size(ObjectType::Commit, &commit_csum)?;
    let raw = repo.load_metadata(ObjectType::Commit, &commit_csum)?;
    assert_eq!(size as usize, raw.len());
    Ok(())
}

#[test]
fn test_summary_regeneration() -> Result<()> {
    let td = tempdir();
    let repo = Repo::create(td.path(), StorageMode::Archive)?;
    let c1 = write_sample_commit(&repo, "one")?;
    let c2 = write_sample_commit(&repo, "two")?;
    repo.write_ref("r2", &c2)?;
    repo.write_ref("r1", &c1)?;

    // A stale signature from an earlier summary must not survive.
    std::fs::write(td.path().join("summary.sig"), b"stale")?;
    regenerate_summary(&repo, None)?;
    assert!(!td.path().join("summary.sig").exists());

    let bytes = std::fs::read(td.path().join("summary"))?;
    let summary = Summary::from_bytes(&bytes)?;
    let names: Vec<&str> = summary.refs.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["r1", "r2"]);
    assert_eq!(summary.refs[0].1.checksum, c1);
    assert_eq!(
        summary.refs[0].1.metadata.get(ostree_repo::KEY_COMMIT_TIMESTAMP),
        Some(&Variant::Uint64(TS))
    );
    assert_eq!(
        summary.refs[0].1.size,
        repo.query_object_size(ObjectType::Commit, &c1)?
    );
    assert!(matches!(
        summary.metadata.get(ostree_repo::KEY_LAST_MODIFIED),
        Some(Variant::Uint64(t)) if *t > 0
    ));
    assert!(matches!(
        summary.metadata.get(ostree_repo::KEY_STATIC_DELTAS),
        Some(Variant::Dict(d)) if d.is_empty()
    ));
    Ok(())
}

#[test]
fn test_summary_collections() -> Result<()> {
    let td = tempdir();
    let repo_path = td.path().join("repo");
    drop(Repo::create(&repo_path, StorageMode::Archive)?);
    append_core_key(&repo_path, "collection-id = org.example.Main")?;
    let repo = Repo::open(&repo_path)?;

    let c1 = write_sample_commit(&repo, "main")?;
    repo.write_ref("main-ref", &c1)?;
    // A mirrored ref from a foreign collection, and one from our own
    // (which stays in the main list and is skipped in the map).
    for (cid, name) in [("org.example.Other", "their-ref"), ("org.example.Main", "ours")] {
        let dir = repo_path.join("refs/mirrors").join(cid);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(name), format!("{c1}\n"))?;
    }

    regenerate_summary(&repo, None)?;
    let summary = Summary::from_bytes(&std::fs::read(repo_path.join("summary"))?)?;
    assert_eq!(
        summary.metadata.get(ostree_repo::KEY_COLLECTION_ID),
        Some(&Variant::String("org.example.Main".to_string()))
    );
    match summary.metadata.get(ostree_repo::KEY_COLLECTION_MAP) {
        Some(Variant::Other(ts, bytes)) => {
            assert_eq!(ts, "a{sa(s(taya{sv}))}");
            assert!(!bytes.is_empty());
        }
        o => panic!("Unexpected collection map {o:?}"),
    }
    Ok(())
}

mod gpg {
    use super::*;
    use std::sync::Mutex;

    /// A toy engine: packets are `SIG/<keyid>/<hex digest>;` so they are
    /// trivially self-delimiting.
    struct StubEngine {
        verified: Mutex<Vec<usize>>,
    }

    impl GpgEngine for StubEngine {
        fn sign(&self, data: &[u8], key_id: &str) -> Result<Vec<u8>> {
            let digest = Checksum::digest(data)?;
            Ok(format!("SIG/{key_id}/{digest};").into_bytes())
        }

        fn key_id_of_packet(&self, packet: &[u8]) -> Result<String> {
            let s = std::str::from_utf8(packet)?;
            Ok(s.split('/').nth(1).unwrap_or_default().to_string())
        }

        fn verify(
            &self,
            data: &[u8],
            signatures: &[u8],
            keyrings: &[KeyringSource],
        ) -> Result<usize> {
            self.verified.lock().unwrap().push(keyrings.len());
            let digest = Checksum::digest(data)?.to_hex();
            let text = std::str::from_utf8(signatures)?;
            Ok(text
                .split_terminator(';')
                .filter(|p| p.ends_with(&digest))
                .count())
        }
    }

    fn ensure_engine() {
        let _ = ostree_repo::set_gpg_engine(Box::new(StubEngine {
            verified: Mutex::new(Vec::new()),
        }));
    }

    #[test]
    fn test_sign_and_verify_commit() -> Result<()> {
        ensure_engine();
        let td = tempdir();
        let repo = Repo::create(td.path(), StorageMode::Archive)?;
        let commit_csum = write_sample_commit(&repo, "tosign")?;

        repo.sign_commit(&commit_csum, "7FCA23D8472CDAFA")?;
        let meta = repo.load_commit_meta(&commit_csum)?;
        match meta.get(ostree_repo::KEY_GPG_SIGS) {
            Some(Variant::ByteArrays(sigs)) => assert_eq!(sigs.len(), 1),
            o => panic!("Unexpected signature list {o:?}"),
        }

        // Same key again: rejected.  Another key: appended.
        let e = repo.sign_commit(&commit_csum, "7FCA23D8472CDAFA").unwrap_err();
        assert!(
            matches!(e.downcast_ref::<Error>(), Some(Error::AlreadyExists(_))),
            "{e}"
        );
        repo.sign_commit(&commit_csum, "5E65DE75AB1C5018")?;
        let n = repo.verify_commit(&commit_csum, None, None, None)?;
        assert_eq!(n, 2);
        Ok(())
    }

    #[test]
    fn test_sign_summary() -> Result<()> {
        ensure_engine();
        let td = tempdir();
        let repo = Repo::create(td.path(), StorageMode::Archive)?;
        let c = write_sample_commit(&repo, "summarized")?;
        repo.write_ref("main", &c)?;
        regenerate_summary(&repo, None)?;
        repo.sign_summary("7FCA23D8472CDAFA")?;
        assert!(td.path().join("summary.sig").exists());
        // Regenerating invalidates the signature again.
        regenerate_summary(&repo, None)?;
        assert!(!td.path().join("summary.sig").exists());
        Ok(())
    }

    #[test]
    fn test_keyring_resolution() -> Result<()> {
        ensure_engine();
        let td = tempdir();
        let repo = Repo::create(td.path(), StorageMode::Archive)?;
        repo.remote_add("origin", "https://x/os", &[], false)?;
        std::fs::write(td.path().join("origin.trustedkeys.gpg"), b"keyring")?;
        let commit_csum = write_sample_commit(&repo, "keyringed")?;
        repo.sign_commit(&commit_csum, "KEY")?;
        // Verification against the remote finds the repo-local keyring.
        let n = repo.verify_commit(&commit_csum, Some("origin"), None, None)?;
        assert_eq!(n, 1);
        Ok(())
    }
}
