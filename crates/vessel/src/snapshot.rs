//! Filesystem snapshots.
//!
//! A snapshot is an [`FsSpec`] captured from a real directory: every entry's
//! type, ownership, mode, size, mtime, xattrs and content digest. Snapshots
//! are persisted per manifest digest so a later commit can diff the live
//! rootfs against its parent without re-reading the parent layer tars.

use std::collections::HashMap;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::debug;
use rustix::fs::{major, minor};
use walkdir::WalkDir;

use crate::atomic;
use crate::digest::Digest;
use crate::error::{Context, Error, Result};
use crate::fsspec::{
    AttrSet, DeviceKind, DeviceNum, FileAttrs, FsSpec, Source, ROOTLESS_OWNER_XATTR,
};
use crate::idmap::IdMappings;
use crate::util::DigestReader;

/// Capture a snapshot of `rootfs`.
///
/// Host uid/gid values are translated back into container ids through
/// `mappings`; an owner recorded by the rootless xattr fallback takes
/// precedence. Hardlinked files are detected by `(dev, ino)` and share a
/// source in the resulting tree.
pub fn snapshot(rootfs: &Path, mappings: &IdMappings) -> Result<FsSpec> {
    let mut tree = FsSpec::new();
    let mut seen_inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();

    for entry in WalkDir::new(rootfs).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::Corrupt(format!("walk {}: {e}", rootfs.display()))
        })?;
        let meta = entry
            .metadata()
            .map_err(|e| Error::Corrupt(format!("stat {}: {e}", entry.path().display())))?;
        let rel = entry
            .path()
            .strip_prefix(rootfs)
            .map_err(|_| Error::corrupt("walk escaped the rootfs"))?;
        let tree_path = Path::new("/").join(rel);
        let file_type = meta.file_type();

        let mut attrs = FileAttrs {
            mode: Some(meta.mode() & 0o7777),
            mtime: Some(meta.mtime()),
            ..FileAttrs::default()
        };
        attrs.uid = Some(to_container_id(mappings, meta.uid(), true));
        attrs.gid = Some(to_container_id(mappings, meta.gid(), false));

        if !file_type.is_symlink() {
            read_xattrs(entry.path(), &mut attrs)?;
        }

        if file_type.is_dir() {
            tree.add_upper(&tree_path, Rc::new(Source::Dir), attrs)?;
        } else if file_type.is_file() {
            if meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(first) = seen_inodes.get(&key) {
                    tree.link(&tree_path, first)?;
                    continue;
                }
                seen_inodes.insert(key, tree_path.clone());
            }
            attrs.size = Some(meta.len());
            let digest = hash_file(entry.path())?;
            let id = tree.add_upper(
                &tree_path,
                Source::file_from_host(entry.path()),
                attrs,
            )?;
            tree.derived_mut(id).hash = Some(digest);
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())
                .with_ctx(|| format!("read symlink {}", entry.path().display()))?;
            attrs.link_target = Some(target.clone());
            tree.add_upper(&tree_path, Source::symlink(target), attrs)?;
        } else if file_type.is_fifo() {
            tree.add_upper(&tree_path, Rc::new(Source::Fifo), attrs)?;
        } else if file_type.is_block_device() || file_type.is_char_device() {
            let rdev = meta.rdev();
            let device = DeviceNum {
                kind: if file_type.is_block_device() {
                    DeviceKind::Block
                } else {
                    DeviceKind::Char
                },
                major: major(rdev),
                minor: minor(rdev),
            };
            attrs.device = Some(device);
            tree.add_upper(&tree_path, Rc::new(Source::Device(device)), attrs)?;
        } else {
            debug!("skipping unsupported file type at {}", entry.path().display());
        }
    }
    Ok(tree)
}

fn to_container_id(mappings: &IdMappings, host: u32, is_uid: bool) -> u32 {
    let mapped = if is_uid {
        mappings.uid_to_container(host)
    } else {
        mappings.gid_to_container(host)
    };
    mapped.unwrap_or_else(|_| {
        debug!("host id {host} is unmapped, keeping as-is");
        host
    })
}

fn read_xattrs(path: &Path, attrs: &mut FileAttrs) -> Result<()> {
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) => {
            debug!("cannot list xattrs of {}: {e}", path.display());
            return Ok(());
        }
    };
    for name in names {
        let Ok(Some(value)) = xattr::get(path, &name) else {
            continue;
        };
        if name == ROOTLESS_OWNER_XATTR {
            // the rootless chown fallback: restore the intended owner
            if let Some((uid, gid)) = std::str::from_utf8(&value)
                .ok()
                .and_then(|s| s.split_once(':'))
                .and_then(|(u, g)| Some((u.parse().ok()?, g.parse().ok()?)))
            {
                attrs.uid = Some(uid);
                attrs.gid = Some(gid);
            }
            continue;
        }
        attrs.xattrs.insert(name, value);
    }
    Ok(())
}

fn hash_file(path: &Path) -> Result<Digest> {
    let file =
        std::fs::File::open(path).with_ctx(|| format!("open {}", path.display()))?;
    let mut reader = DigestReader::new(file);
    std::io::copy(&mut reader, &mut std::io::sink())
        .with_ctx(|| format!("hash {}", path.display()))?;
    Ok(reader.finalize())
}

/// How an entry differs between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One entry of a snapshot diff listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Flatten a diff tree into a change listing against `from`.
///
/// Context directories (present only to carry changed descendants) are not
/// listed.
pub fn changes(from: &FsSpec, diff: &FsSpec) -> Vec<Change> {
    fn visit(from: &FsSpec, diff: &FsSpec, id: crate::fsspec::NodeId, out: &mut Vec<Change>) {
        for child in diff.children(id) {
            let path = diff.path_of(*child);
            let kind = diff.kind(*child);
            if kind == crate::fsspec::NodeKind::Whiteout {
                out.push(Change {
                    path,
                    kind: ChangeKind::Removed,
                });
                continue;
            }
            let existed = from.node_nofollow(&path).is_ok();
            let is_context = kind.is_dir_like() && existed && !diff.children(*child).is_empty() && {
                // a dir whose own metadata is unchanged is context only
                from.node_nofollow(&path)
                    .map(|from_id| from.attrs(from_id) == diff.attrs(*child))
                    .unwrap_or(false)
            };
            if !is_context {
                out.push(Change {
                    path: path.clone(),
                    kind: if existed {
                        ChangeKind::Modified
                    } else {
                        ChangeKind::Added
                    },
                });
            }
            if kind.is_dir_like() {
                visit(from, diff, *child, out);
            }
        }
    }

    let mut out = Vec::new();
    visit(from, diff, diff.root(), &mut out);
    out
}

/// Persists one snapshot per manifest digest.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_ctx(|| format!("create snapshot directory {}", root.display()))?;
        Ok(SnapshotStore { root })
    }

    fn path(&self, manifest: &Digest) -> PathBuf {
        self.root.join(manifest.blob_path())
    }

    /// Load the snapshot stored for a manifest, if any.
    pub fn get(&self, manifest: &Digest) -> Result<Option<FsSpec>> {
        let path = self.path(manifest);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_ctx(|| format!("read snapshot {manifest}")),
        };
        Ok(Some(
            FsSpec::parse_spec(&data).with_ctx(|| format!("parse snapshot {manifest}"))?,
        ))
    }

    /// Store a snapshot for a manifest. Snapshots are immutable: if one is
    /// already present it is left untouched.
    pub fn put(&self, manifest: &Digest, tree: &FsSpec) -> Result<()> {
        let path = self.path(manifest);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_ctx(|| format!("create snapshot directory {}", parent.display()))?;
        }
        let mut data = Vec::new();
        tree.write_to(&mut data, &AttrSet::COMPARE)?;
        atomic::write_file(&path, &data).with_ctx(|| format!("store snapshot {manifest}"))
    }

    /// Delete every snapshot whose manifest digest is not in `keep`.
    /// Unparseable entries are logged and preserved.
    pub fn retain(&self, keep: &std::collections::HashSet<Digest>) -> Result<()> {
        let top = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).ctx("read snapshot directory"),
        };
        for algo_entry in top {
            let algo_entry = algo_entry.ctx("read snapshot directory")?;
            let algo_name = algo_entry.file_name();
            let Some(algo) = algo_name.to_str() else { continue };
            if !algo_entry.file_type().ctx("stat snapshot entry")?.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(algo_entry.path()).ctx("read snapshot directory")? {
                let entry = entry.ctx("read snapshot directory")?;
                let name = entry.file_name();
                let digest = name
                    .to_str()
                    .and_then(|hex| Digest::parse(&format!("{algo}:{hex}")).ok());
                match digest {
                    Some(digest) if keep.contains(&digest) => {}
                    Some(digest) => {
                        debug!("removing snapshot of dropped manifest {digest}");
                        std::fs::remove_file(entry.path())
                            .with_ctx(|| format!("remove snapshot {digest}"))?;
                    }
                    None => debug!("preserving unparseable snapshot entry {name:?}"),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rootfs(dir: &Path) -> PathBuf {
        let rootfs = dir.join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::write(rootfs.join("etc/motd"), "welcome\n").unwrap();
        std::os::unix::fs::symlink("motd", rootfs.join("etc/motd.link")).unwrap();
        std::fs::hard_link(rootfs.join("etc/motd"), rootfs.join("etc/motd.hard")).unwrap();
        rootfs
    }

    #[test]
    fn test_snapshot_captures_content() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = make_rootfs(tmp.path());
        let tree = snapshot(&rootfs, &IdMappings::identity()).unwrap();

        let motd = tree.node_nofollow("/etc/motd").unwrap();
        assert_eq!(tree.attrs(motd).size, Some(8));
        assert_eq!(
            tree.derived(motd).hash,
            Some(Digest::sha256_of(b"welcome\n"))
        );

        let link = tree.node_nofollow("/etc/motd.link").unwrap();
        assert_eq!(
            tree.attrs(link).link_target,
            Some(PathBuf::from("motd"))
        );

        let hard = tree.node_nofollow("/etc/motd.hard").unwrap();
        assert!(tree.is_hardlink(hard) || tree.is_hardlink(motd));
        assert!(crate::fsspec::same_source(tree.source(hard), tree.source(motd)));
    }

    #[test]
    fn test_snapshot_self_diff_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = make_rootfs(tmp.path());
        let a = snapshot(&rootfs, &IdMappings::identity()).unwrap();
        let b = snapshot(&rootfs, &IdMappings::identity()).unwrap();
        assert!(a.diff(&b).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_detects_change() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = make_rootfs(tmp.path());
        let before = snapshot(&rootfs, &IdMappings::identity()).unwrap();

        std::fs::write(rootfs.join("etc/new-file"), "fresh").unwrap();
        std::fs::remove_file(rootfs.join("etc/motd.link")).unwrap();
        let after = snapshot(&rootfs, &IdMappings::identity()).unwrap();

        let diff = before.diff(&after).unwrap();
        assert!(diff.node("/etc/new-file").is_ok());
        assert_eq!(
            diff.kind(diff.node("/etc/motd.link").unwrap()),
            crate::fsspec::NodeKind::Whiteout
        );
    }

    #[test]
    fn test_change_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = make_rootfs(tmp.path());
        let before = snapshot(&rootfs, &IdMappings::identity()).unwrap();

        std::fs::write(rootfs.join("etc/new"), "n").unwrap();
        std::fs::write(rootfs.join("etc/motd"), "changed\n").unwrap();
        std::fs::remove_file(rootfs.join("etc/motd.link")).unwrap();
        let after = snapshot(&rootfs, &IdMappings::identity()).unwrap();

        let diff = before.diff(&after).unwrap();
        let mut listing = changes(&before, &diff);
        listing.sort_by(|a, b| a.path.cmp(&b.path));
        let rendered: Vec<String> = listing
            .iter()
            .map(|c| format!("{:?} {}", c.kind, c.path.display()))
            .collect();
        // /etc itself is unchanged context; motd.hard shares motd's inode
        // and rides along with the modification
        assert!(rendered.contains(&"Modified /etc/motd".to_string()), "{rendered:?}");
        assert!(rendered.contains(&"Added /etc/new".to_string()), "{rendered:?}");
        assert!(rendered.contains(&"Removed /etc/motd.link".to_string()), "{rendered:?}");
    }

    #[test]
    fn test_store_roundtrip_and_immutability() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = make_rootfs(tmp.path());
        let store = SnapshotStore::open(tmp.path().join(".fsspec")).unwrap();
        let manifest = Digest::sha256_of(b"fake-manifest");

        assert!(store.get(&manifest).unwrap().is_none());

        let tree = snapshot(&rootfs, &IdMappings::identity()).unwrap();
        store.put(&manifest, &tree).unwrap();
        let loaded = store.get(&manifest).unwrap().unwrap();

        // the loaded snapshot compares clean against a fresh walk
        assert!(loaded.diff(&tree).unwrap().is_empty());

        // immutable: a second put with different content is ignored
        store.put(&manifest, &FsSpec::new()).unwrap();
        let still = store.get(&manifest).unwrap().unwrap();
        assert!(still.node("/etc/motd").is_ok());
    }
}
