//! Writing trees into a real directory.
//!
//! Every target path is resolved with a secure join against the configured
//! root: intermediate symlinks are followed manually, absolute targets
//! re-root inside the root, and `..` clamps at the root, so content inside
//! the tree can never redirect a write outside of it.
//!
//! In rootless mode ownership cannot be applied with chown; the intended
//! owner is recorded in an xattr instead so a later snapshot walk can restore
//! it. Device nodes are faked as empty regular files, and EPERM while
//! writing `security.*` xattrs is demoted to a warning.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use log::{debug, warn};
use rustix::fs::{makedev, mknodat, FileType, Mode, CWD};
use rustix::process::geteuid;

use crate::error::{Context, Error, Result};
use crate::fsspec::attrs::{DeviceKind, FileAttrs};
use crate::fsspec::writer::Writer;
use crate::idmap::IdMappings;

/// Xattr recording the intended container owner when chown is unavailable.
pub const ROOTLESS_OWNER_XATTR: &str = "user.rootlesscontainers";

const MAX_LINK_DEPTH: u32 = 255;

/// Resolve `path` under `root` without ever escaping it.
///
/// Intermediate symlinks are resolved against the root (absolute targets
/// re-root, `..` clamps); a symlink at the final component is not followed so
/// that a write replaces the link rather than its target.
pub fn secure_join(root: &Path, path: &Path) -> Result<PathBuf> {
    let mut todo: VecDeque<OsString> = VecDeque::new();
    push_components(&mut todo, path)?;

    let mut resolved = root.to_path_buf();
    let mut depth = 0;
    while let Some(component) = todo.pop_front() {
        if component.as_bytes() == b".." {
            if resolved != root {
                resolved.pop();
            }
            continue;
        }
        let candidate = resolved.join(&component);
        let is_final = todo.is_empty();
        match std::fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() && !is_final => {
                depth += 1;
                if depth > MAX_LINK_DEPTH {
                    return Err(Error::invalid_input(format!(
                        "too many levels of symbolic links under {}",
                        root.display()
                    )));
                }
                let target = std::fs::read_link(&candidate)
                    .with_ctx(|| format!("read symlink {}", candidate.display()))?;
                if target.is_absolute() {
                    resolved = root.to_path_buf();
                }
                let mut expansion = VecDeque::new();
                push_components(&mut expansion, &target)?;
                while let Some(piece) = expansion.pop_back() {
                    todo.push_front(piece);
                }
            }
            _ => resolved = candidate,
        }
    }
    Ok(resolved)
}

fn push_components(queue: &mut VecDeque<OsString>, path: &Path) -> Result<()> {
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Prefix(..) => {
                return Err(Error::invalid_input(format!(
                    "unsupported path {}",
                    path.display()
                )))
            }
            Component::ParentDir => queue.push_back(OsString::from("..")),
            Component::Normal(name) => queue.push_back(name.to_os_string()),
        }
    }
    Ok(())
}

/// Writes a tree into a host directory.
pub struct DirWriter {
    root: PathBuf,
    mappings: IdMappings,
    rootless: bool,
    /// Directory timestamps, applied on close so child writes don't clobber
    /// parent mtimes.
    dir_times: Vec<(PathBuf, FileTime, FileTime)>,
}

impl DirWriter {
    /// Create a writer targeting `root` (created if missing). Rootless mode
    /// is selected automatically when not running as uid 0.
    pub fn new(root: impl Into<PathBuf>, mappings: IdMappings) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_ctx(|| format!("create target directory {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_ctx(|| format!("canonicalize target directory {}", root.display()))?;
        Ok(DirWriter {
            root,
            mappings,
            rootless: !geteuid().is_root(),
            dir_times: Vec::new(),
        })
    }

    /// Force rootless behavior on or off (primarily for tests).
    pub fn with_rootless(mut self, rootless: bool) -> Self {
        self.rootless = rootless;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dest(&self, path: &Path) -> Result<PathBuf> {
        secure_join(&self.root, path)
    }

    fn ensure_parent(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_ctx(|| format!("create parent directory {}", parent.display()))?;
        }
        Ok(())
    }

    /// Remove whatever sits at `dest`, whether file, symlink or tree.
    fn remove_existing(&self, dest: &Path) -> Result<()> {
        match std::fs::symlink_metadata(dest) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(dest)
                .with_ctx(|| format!("remove directory {}", dest.display())),
            Ok(_) => std::fs::remove_file(dest)
                .with_ctx(|| format!("remove file {}", dest.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_ctx(|| format!("stat {}", dest.display())),
        }
    }

    fn apply_mode(&self, dest: &Path, attrs: &FileAttrs, default: u32) -> Result<()> {
        std::fs::set_permissions(
            dest,
            std::fs::Permissions::from_mode(attrs.mode_or(default)),
        )
        .with_ctx(|| format!("set mode on {}", dest.display()))
    }

    fn apply_owner(&self, dest: &Path, attrs: &FileAttrs, symlink: bool) -> Result<()> {
        let (uid, gid) = (attrs.uid_or_root(), attrs.gid_or_root());
        if self.rootless {
            // chown is unavailable; record the intended owner instead
            if (uid, gid) != (0, 0) {
                if let Err(e) = xattr::set(dest, ROOTLESS_OWNER_XATTR, format!("{uid}:{gid}").as_bytes())
                {
                    debug!("cannot record owner of {}: {e}", dest.display());
                }
            }
            return Ok(());
        }
        let host_uid = self.mappings.uid_to_host(uid)?;
        let host_gid = self.mappings.gid_to_host(gid)?;
        let result = if symlink {
            std::os::unix::fs::lchown(dest, Some(host_uid), Some(host_gid))
        } else {
            std::os::unix::fs::chown(dest, Some(host_uid), Some(host_gid))
        };
        result.with_ctx(|| format!("chown {}", dest.display()))
    }

    fn apply_xattrs(&self, dest: &Path, attrs: &FileAttrs) -> Result<()> {
        for (key, value) in &attrs.xattrs {
            match xattr::set(dest, key, value) {
                Ok(()) => {}
                Err(e)
                    if e.kind() == std::io::ErrorKind::PermissionDenied
                        && self.rootless
                        && key.as_bytes().starts_with(b"security.") =>
                {
                    warn!(
                        "cannot apply xattr {key:?} on {} in rootless mode: {e}",
                        dest.display()
                    );
                }
                Err(e) => {
                    return Err(e).with_ctx(|| {
                        format!("set xattr {key:?} on {}", dest.display())
                    })
                }
            }
        }
        Ok(())
    }

    fn times(attrs: &FileAttrs) -> Option<(FileTime, FileTime)> {
        let mtime = attrs.mtime?;
        let atime = attrs.atime.unwrap_or(mtime);
        Some((
            FileTime::from_unix_time(atime, 0),
            FileTime::from_unix_time(mtime, 0),
        ))
    }

    fn apply_leaf_times(&self, dest: &Path, attrs: &FileAttrs) -> Result<()> {
        if let Some((atime, mtime)) = Self::times(attrs) {
            filetime::set_symlink_file_times(dest, atime, mtime)
                .with_ctx(|| format!("set times on {}", dest.display()))?;
        }
        Ok(())
    }
}

impl Writer for DirWriter {
    fn file(&mut self, path: &Path, attrs: &FileAttrs, content: &mut dyn Read) -> Result<()> {
        let dest = self.dest(path)?;
        self.ensure_parent(&dest)?;
        self.remove_existing(&dest)?;

        let mut file =
            File::create(&dest).with_ctx(|| format!("create file {}", dest.display()))?;
        std::io::copy(content, &mut file)
            .with_ctx(|| format!("write file {}", dest.display()))?;
        drop(file);

        self.apply_mode(&dest, attrs, 0o644)?;
        self.apply_owner(&dest, attrs, false)?;
        self.apply_xattrs(&dest, attrs)?;
        self.apply_leaf_times(&dest, attrs)
    }

    fn hardlink(&mut self, path: &Path, target: &Path) -> Result<()> {
        let dest = self.dest(path)?;
        let target = self.dest(target)?;
        self.ensure_parent(&dest)?;
        self.remove_existing(&dest)?;
        std::fs::hard_link(&target, &dest).with_ctx(|| {
            format!("hardlink {} -> {}", dest.display(), target.display())
        })
    }

    fn symlink(&mut self, path: &Path, target: &Path, attrs: &FileAttrs) -> Result<()> {
        let dest = self.dest(path)?;
        self.ensure_parent(&dest)?;
        self.remove_existing(&dest)?;
        std::os::unix::fs::symlink(target, &dest)
            .with_ctx(|| format!("symlink {}", dest.display()))?;
        self.apply_owner(&dest, attrs, true)?;
        self.apply_leaf_times(&dest, attrs)
    }

    fn dir(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        let dest = self.dest(path)?;
        match std::fs::symlink_metadata(&dest) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                self.remove_existing(&dest)?;
                std::fs::create_dir(&dest)
                    .with_ctx(|| format!("create directory {}", dest.display()))?;
            }
            Err(_) => {
                self.ensure_parent(&dest)?;
                std::fs::create_dir(&dest)
                    .with_ctx(|| format!("create directory {}", dest.display()))?;
            }
        }
        self.apply_mode(&dest, attrs, 0o755)?;
        self.apply_owner(&dest, attrs, false)?;
        self.apply_xattrs(&dest, attrs)?;
        if let Some((atime, mtime)) = Self::times(attrs) {
            self.dir_times.push((dest, atime, mtime));
        }
        Ok(())
    }

    fn mkdir(&mut self, path: &Path) -> Result<()> {
        let dest = self.dest(path)?;
        std::fs::create_dir_all(&dest)
            .with_ctx(|| format!("create directory {}", dest.display()))
    }

    fn fifo(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        let dest = self.dest(path)?;
        self.ensure_parent(&dest)?;
        self.remove_existing(&dest)?;
        mknodat(
            CWD,
            &dest,
            FileType::Fifo,
            Mode::from_raw_mode(attrs.mode_or(0o644)),
            0,
        )
        .map_err(std::io::Error::from)
        .with_ctx(|| format!("mkfifo {}", dest.display()))?;
        self.apply_owner(&dest, attrs, false)?;
        self.apply_leaf_times(&dest, attrs)
    }

    fn device(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        let dest = self.dest(path)?;
        self.ensure_parent(&dest)?;
        self.remove_existing(&dest)?;

        if self.rootless {
            // mknod needs privileges; fake the node as an empty regular file
            File::create(&dest).with_ctx(|| format!("create {}", dest.display()))?;
            self.apply_mode(&dest, attrs, 0o644)?;
            return self.apply_leaf_times(&dest, attrs);
        }

        let device = attrs.device.ok_or_else(|| {
            Error::corrupt(format!("device {} without device numbers", dest.display()))
        })?;
        let file_type = match device.kind {
            DeviceKind::Block => FileType::BlockDevice,
            DeviceKind::Char => FileType::CharacterDevice,
        };
        mknodat(
            CWD,
            &dest,
            file_type,
            Mode::from_raw_mode(attrs.mode_or(0o644)),
            makedev(device.major, device.minor),
        )
        .map_err(std::io::Error::from)
        .with_ctx(|| format!("mknod {}", dest.display()))?;
        self.apply_owner(&dest, attrs, false)?;
        self.apply_leaf_times(&dest, attrs)
    }

    fn whiteout(&mut self, path: &Path) -> Result<()> {
        let dest = self.dest(path)?;
        self.remove_existing(&dest)
    }

    fn opaque(&mut self, path: &Path) -> Result<()> {
        let dest = self.dest(path)?;
        let entries = match std::fs::read_dir(&dest) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_ctx(|| format!("read directory {}", dest.display())),
        };
        for entry in entries {
            let entry = entry.with_ctx(|| format!("read directory {}", dest.display()))?;
            self.remove_existing(&entry.path())?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // children were all written by now; restore directory times
        for (dest, atime, mtime) in self.dir_times.drain(..).rev() {
            filetime::set_file_times(&dest, atime, mtime)
                .with_ctx(|| format!("set times on {}", dest.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    fn writer(dir: &Path) -> DirWriter {
        DirWriter::new(dir.join("root"), IdMappings::identity()).unwrap()
    }

    #[test]
    fn test_file_and_dir_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());

        let mut dir_attrs = FileAttrs::with_mode(0o750);
        dir_attrs.mtime = Some(1_000_000);
        w.dir(Path::new("/sub"), &dir_attrs).unwrap();

        let mut attrs = FileAttrs::with_mode(0o604);
        attrs.mtime = Some(2_000_000);
        w.file(Path::new("/sub/hello"), &attrs, &mut &b"hi\n"[..])
            .unwrap();
        w.close().unwrap();

        let root = w.root().to_path_buf();
        let file = root.join("sub/hello");
        assert_eq!(std::fs::read(&file).unwrap(), b"hi\n");
        assert_eq!(std::fs::metadata(&file).unwrap().mode() & 0o7777, 0o604);
        assert_eq!(std::fs::metadata(&file).unwrap().mtime(), 2_000_000);
        // the dir mtime survived the child write
        assert_eq!(std::fs::metadata(root.join("sub")).unwrap().mtime(), 1_000_000);
    }

    #[test]
    fn test_hardlink_shares_inode() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());
        w.file(Path::new("/a"), &FileAttrs::with_mode(0o644), &mut &b"x"[..])
            .unwrap();
        w.hardlink(Path::new("/b"), Path::new("/a")).unwrap();

        let root = w.root().to_path_buf();
        let a = std::fs::metadata(root.join("a")).unwrap();
        let b = std::fs::metadata(root.join("b")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn test_symlink_escape_contained() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());

        // a symlink pointing way outside the root
        w.symlink(
            Path::new("/evil"),
            Path::new("../../../../outside"),
            &FileAttrs::default(),
        )
        .unwrap();
        // writing through it must stay inside the root
        w.file(
            Path::new("/evil/payload"),
            &FileAttrs::default(),
            &mut &b"contained"[..],
        )
        .unwrap();

        let root = w.root().to_path_buf();
        assert!(root.join("outside/payload").exists());
        assert!(!tmp.path().join("outside").exists());
    }

    #[test]
    fn test_absolute_symlink_reroots() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());
        w.dir(Path::new("/etc"), &FileAttrs::default_dir()).unwrap();
        w.symlink(Path::new("/link"), Path::new("/etc"), &FileAttrs::default())
            .unwrap();
        w.file(
            Path::new("/link/conf"),
            &FileAttrs::default(),
            &mut &b"v"[..],
        )
        .unwrap();

        assert!(w.root().join("etc/conf").exists());
    }

    #[test]
    fn test_replace_symlink_not_target() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());
        w.file(Path::new("/target"), &FileAttrs::default(), &mut &b"orig"[..])
            .unwrap();
        w.symlink(Path::new("/name"), Path::new("/target"), &FileAttrs::default())
            .unwrap();

        // writing to /name replaces the symlink itself
        w.file(Path::new("/name"), &FileAttrs::default(), &mut &b"new"[..])
            .unwrap();

        let root = w.root().to_path_buf();
        assert!(!std::fs::symlink_metadata(root.join("name"))
            .unwrap()
            .file_type()
            .is_symlink());
        assert_eq!(std::fs::read(root.join("target")).unwrap(), b"orig");
    }

    #[test]
    fn test_whiteout_and_opaque() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());
        w.file(Path::new("/d/one"), &FileAttrs::default(), &mut &b"1"[..])
            .unwrap();
        w.file(Path::new("/d/two"), &FileAttrs::default(), &mut &b"2"[..])
            .unwrap();

        w.whiteout(Path::new("/d/one")).unwrap();
        let root = w.root().to_path_buf();
        assert!(!root.join("d/one").exists());
        assert!(root.join("d/two").exists());

        w.opaque(Path::new("/d")).unwrap();
        assert!(root.join("d").exists());
        assert!(!root.join("d/two").exists());

        // whiteout of something that never existed is fine
        w.whiteout(Path::new("/ghost")).unwrap();
    }

    #[test]
    fn test_rootless_device_faked() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path()).with_rootless(true);
        let mut attrs = FileAttrs::with_mode(0o666);
        attrs.device = Some(crate::fsspec::attrs::DeviceNum {
            kind: DeviceKind::Char,
            major: 1,
            minor: 3,
        });
        w.device(Path::new("/dev/null"), &attrs).unwrap();

        let meta = std::fs::metadata(w.root().join("dev/null")).unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.len(), 0);
    }

    #[test]
    fn test_rootless_owner_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path()).with_rootless(true);
        let mut attrs = FileAttrs::with_mode(0o644);
        attrs.uid = Some(33);
        attrs.gid = Some(34);
        w.file(Path::new("/owned"), &attrs, &mut &b"x"[..]).unwrap();

        // best effort: if the filesystem supports user xattrs the intended
        // owner is recorded there
        if let Ok(Some(value)) = xattr::get(w.root().join("owned"), ROOTLESS_OWNER_XATTR) {
            assert_eq!(value, b"33:34");
        }
    }
}
