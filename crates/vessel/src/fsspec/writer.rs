//! Writing trees out.
//!
//! [`Writer`] is the capability interface a tree is emitted through: the
//! concrete implementations write into a real directory
//! ([`DirWriter`](crate::fsspec::DirWriter)) or a tar stream
//! ([`TarWriter`](crate::fsspec::TarWriter)); the decorators in this module
//! wrap any writer to compute content digests ([`HashingWriter`]) or to build
//! an in-memory tree of everything written ([`FsNodeWriter`]).
//!
//! [`FsSpec::write`] drives a depth-first traversal, keeps a source → path
//! map so a shared source's second occurrence becomes a hardlink record, and
//! expands archive overlay sources into individual writer operations.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use log::debug;

use crate::digest::Digest;
use crate::error::{Context, Error, Result};
use crate::fsspec::attrs::{DeviceKind, DeviceNum, FileAttrs};
use crate::fsspec::node::{FsSpec, NodeId, NodeKind};
use crate::fsspec::source::{underlying, Compression, Source};
use crate::util::DigestReader;

/// The operations a tree emits while being written.
///
/// Paths are absolute within the tree (rooted at `/`). Hardlink targets are
/// always paths that were written earlier in the same run.
pub trait Writer {
    fn file(&mut self, path: &Path, attrs: &FileAttrs, content: &mut dyn Read) -> Result<()>;
    fn hardlink(&mut self, path: &Path, target: &Path) -> Result<()>;
    fn symlink(&mut self, path: &Path, target: &Path, attrs: &FileAttrs) -> Result<()>;
    fn dir(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()>;
    /// An implicit parent directory; attributes are defaulted.
    fn mkdir(&mut self, path: &Path) -> Result<()>;
    fn fifo(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()>;
    fn device(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()>;
    /// A whiteout: the path is removed from the written state.
    fn whiteout(&mut self, path: &Path) -> Result<()>;
    /// An opaque directory marker: existing content below `path` is dropped.
    fn opaque(&mut self, path: &Path) -> Result<()> {
        let _ = path;
        Ok(())
    }
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Normalize an archive-relative path: no root, no `.`, and `..` may not
/// escape upward.
pub(crate) fn clean_rel_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Prefix(..) => {
                return Err(Error::invalid_input(format!(
                    "unsupported path {}",
                    path.display()
                )))
            }
            Component::ParentDir => {
                if !out.pop() {
                    return Err(Error::invalid_input(format!(
                        "path {} escapes its root",
                        path.display()
                    )));
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }
    Ok(out)
}

impl FsSpec {
    /// Emit the tree through `writer`, closing it at the end.
    pub fn write(&self, writer: &mut dyn Writer) -> Result<()> {
        let mut written: HashMap<*const Source, PathBuf> = HashMap::new();
        for child in self.children(self.root()).to_vec() {
            self.write_node_out(child, writer, &mut written)?;
        }
        writer.close()
    }

    fn write_node_out(
        &self,
        id: NodeId,
        writer: &mut dyn Writer,
        written: &mut HashMap<*const Source, PathBuf>,
    ) -> Result<()> {
        let path = self.path_of(id);
        let attrs = self.attrs(id);
        let lower = self.is_lower(id);

        match self.kind(id) {
            NodeKind::Dir => {
                // implicit parents only contribute a mkdir -p
                if lower || matches!(&**self.source(id), Source::ParentDir) {
                    writer.mkdir(&path)?;
                } else {
                    writer.dir(&path, attrs)?;
                }
                for child in self.children(id).to_vec() {
                    self.write_node_out(child, writer, written)?;
                }
            }
            NodeKind::Overlay => {
                if lower {
                    writer.mkdir(&path)?;
                } else {
                    writer.dir(&path, attrs)?;
                }
                self.expand_overlay(id, &path, writer)
                    .with_ctx(|| format!("expand overlay {}", path.display()))?;
                // explicit children were added after the overlay and override
                // whatever the archive produced
                for child in self.children(id).to_vec() {
                    self.write_node_out(child, writer, written)?;
                }
            }
            NodeKind::Whiteout => writer.whiteout(&path)?,
            kind => {
                if lower {
                    return Ok(());
                }
                let key = Rc::as_ptr(underlying(self.source(id)));
                if let Some(first) = written.get(&key) {
                    return writer.hardlink(&path, first);
                }
                match kind {
                    NodeKind::File => {
                        let mut content = self.source(id).open_content()?;
                        writer.file(&path, attrs, &mut content)?;
                    }
                    NodeKind::Symlink => {
                        let target = match &**underlying(self.source(id)) {
                            Source::Symlink(target) => target.clone(),
                            _ => attrs.link_target.clone().ok_or_else(|| {
                                Error::corrupt(format!(
                                    "symlink {} has no target",
                                    path.display()
                                ))
                            })?,
                        };
                        writer.symlink(&path, &target, attrs)?;
                    }
                    NodeKind::Fifo => writer.fifo(&path, attrs)?,
                    NodeKind::Device => writer.device(&path, attrs)?,
                    _ => unreachable!("dir kinds handled above"),
                }
                written.insert(key, path);
            }
        }
        Ok(())
    }

    /// Expand a tar overlay source into writer operations below `base`.
    fn expand_overlay(&self, id: NodeId, base: &Path, writer: &mut dyn Writer) -> Result<()> {
        let Source::TarOverlay(tar) = &**self.source(id) else {
            return Err(Error::corrupt(format!(
                "overlay node {} has a non-archive source",
                base.display()
            )));
        };
        let file = std::fs::File::open(&tar.path)
            .with_ctx(|| format!("open archive {}", tar.path.display()))?;
        let reader: Box<dyn Read> = match tar.compression {
            Compression::None => Box::new(file),
            Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
            Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
        };
        write_tar_entries(reader, base, writer)
    }
}

/// Feed every entry of a tar stream through a writer, rebasing paths under
/// `base`.
pub fn write_tar_entries(reader: impl Read, base: &Path, writer: &mut dyn Writer) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().ctx("read archive")? {
        let mut entry = entry.ctx("read archive entry")?;
        let rel = clean_rel_path(&entry.path().ctx("read entry path")?)?;
        if rel.as_os_str().is_empty() {
            continue; // the archive's own root entry
        }
        let path = base.join(&rel);

        // overlay whiteout names translate back to removal operations
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name == ".wh..wh..opq" {
                let parent = path.parent().unwrap_or(base).to_path_buf();
                writer.opaque(&parent)?;
                continue;
            }
            if let Some(real) = name.strip_prefix(".wh.") {
                let target = path.with_file_name(real);
                writer.whiteout(&target)?;
                continue;
            }
        }

        let attrs = entry_attrs(&mut entry)?;
        use tar::EntryType::*;
        match entry.header().entry_type() {
            Directory => writer.dir(&path, &attrs)?,
            Regular | Continuous => writer.file(&path, &attrs, &mut entry)?,
            Symlink => {
                let target = entry
                    .link_name()
                    .ctx("read symlink target")?
                    .ok_or_else(|| Error::corrupt("symlink entry without target"))?;
                writer.symlink(&path, &target, &attrs)?;
            }
            Link => {
                let target = entry
                    .link_name()
                    .ctx("read hardlink target")?
                    .ok_or_else(|| Error::corrupt("hardlink entry without target"))?;
                writer.hardlink(&path, &base.join(clean_rel_path(&target)?))?;
            }
            Fifo => writer.fifo(&path, &attrs)?,
            Block | Char => writer.device(&path, &attrs)?,
            other => {
                debug!("skipping unsupported archive entry type {other:?} at {}", path.display());
            }
        }
    }
    Ok(())
}

/// Extract node attributes from a tar entry header (including PAX xattrs).
fn entry_attrs<R: Read>(entry: &mut tar::Entry<R>) -> Result<FileAttrs> {
    let header = entry.header();
    let mut attrs = FileAttrs {
        mode: Some(header.mode().ctx("read entry mode")? & 0o7777),
        uid: Some(header.uid().ctx("read entry uid")? as u32),
        gid: Some(header.gid().ctx("read entry gid")? as u32),
        mtime: Some(header.mtime().ctx("read entry mtime")? as i64),
        size: Some(header.size().ctx("read entry size")?),
        ..FileAttrs::default()
    };
    match header.entry_type() {
        tar::EntryType::Block | tar::EntryType::Char => {
            let major = header.device_major().ctx("read device major")?.unwrap_or(0);
            let minor = header.device_minor().ctx("read device minor")?.unwrap_or(0);
            attrs.device = Some(DeviceNum {
                kind: if header.entry_type() == tar::EntryType::Block {
                    DeviceKind::Block
                } else {
                    DeviceKind::Char
                },
                major,
                minor,
            });
        }
        _ => {}
    }

    let mut xattrs = BTreeMap::new();
    if let Some(extensions) = entry.pax_extensions().ctx("read pax extensions")? {
        for extension in extensions {
            let extension = extension.ctx("read pax extension")?;
            if let Ok(key) = extension.key() {
                if let Some(xattr_key) = key.strip_prefix("SCHILY.xattr.") {
                    xattrs.insert(
                        OsString::from(xattr_key),
                        extension.value_bytes().to_vec(),
                    );
                }
            }
        }
    }
    attrs.xattrs = xattrs;
    Ok(attrs)
}

/// A writer decorator that digests every file's bytes on the way through.
pub struct HashingWriter<W> {
    inner: W,
    hashes: HashMap<PathBuf, (Digest, u64)>,
}

impl<W: Writer> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hashes: HashMap::new(),
        }
    }

    /// Digest and size per written file path.
    pub fn hashes(&self) -> &HashMap<PathBuf, (Digest, u64)> {
        &self.hashes
    }

    pub fn into_inner(self) -> (W, HashMap<PathBuf, (Digest, u64)>) {
        (self.inner, self.hashes)
    }
}

impl<W: Writer> Writer for HashingWriter<W> {
    fn file(&mut self, path: &Path, attrs: &FileAttrs, content: &mut dyn Read) -> Result<()> {
        let mut tee = DigestReader::new(content);
        self.inner.file(path, attrs, &mut tee)?;
        let count = tee.count();
        self.hashes.insert(path.to_path_buf(), (tee.finalize(), count));
        Ok(())
    }

    fn hardlink(&mut self, path: &Path, target: &Path) -> Result<()> {
        self.inner.hardlink(path, target)
    }

    fn symlink(&mut self, path: &Path, target: &Path, attrs: &FileAttrs) -> Result<()> {
        self.inner.symlink(path, target, attrs)
    }

    fn dir(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        self.inner.dir(path, attrs)
    }

    fn mkdir(&mut self, path: &Path) -> Result<()> {
        self.inner.mkdir(path)
    }

    fn fifo(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        self.inner.fifo(path, attrs)
    }

    fn device(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        self.inner.device(path, attrs)
    }

    fn whiteout(&mut self, path: &Path) -> Result<()> {
        self.inner.whiteout(path)
    }

    fn opaque(&mut self, path: &Path) -> Result<()> {
        self.inner.opaque(path)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// A writer decorator that additionally builds an in-memory tree of
/// everything written — used during extraction to capture the snapshot the
/// next diff will run against.
pub struct FsNodeWriter<W> {
    inner: W,
    tree: FsSpec,
    /// When set, file nodes point at `origin/<path>` so their content can be
    /// re-read from the extracted location.
    origin: Option<PathBuf>,
}

impl<W: Writer> FsNodeWriter<W> {
    pub fn new(inner: W, origin: Option<PathBuf>) -> Self {
        Self {
            inner,
            tree: FsSpec::new(),
            origin,
        }
    }

    pub fn tree(&self) -> &FsSpec {
        &self.tree
    }

    pub fn into_parts(self) -> (W, FsSpec) {
        (self.inner, self.tree)
    }

    fn file_source(&self, path: &Path) -> Rc<Source> {
        match &self.origin {
            Some(origin) => {
                let rel: PathBuf = path.components().skip(1).collect();
                Source::file_from_host(origin.join(rel))
            }
            None => Rc::new(Source::File(crate::fsspec::source::FileSource {
                origin: crate::fsspec::source::FileOrigin::Opaque,
            })),
        }
    }
}

impl<W: Writer> Writer for FsNodeWriter<W> {
    fn file(&mut self, path: &Path, attrs: &FileAttrs, content: &mut dyn Read) -> Result<()> {
        let mut tee = DigestReader::new(content);
        self.inner.file(path, attrs, &mut tee)?;
        let size = tee.count();
        let digest = tee.finalize();

        let mut attrs = attrs.clone();
        attrs.size = Some(size);
        let id = self.tree.add_upper(path, self.file_source(path), attrs)?;
        self.tree.derived_mut(id).hash = Some(digest);
        Ok(())
    }

    fn hardlink(&mut self, path: &Path, target: &Path) -> Result<()> {
        self.inner.hardlink(path, target)?;
        self.tree.link(path, target)?;
        Ok(())
    }

    fn symlink(&mut self, path: &Path, target: &Path, attrs: &FileAttrs) -> Result<()> {
        self.inner.symlink(path, target, attrs)?;
        let mut attrs = attrs.clone();
        attrs.link_target = Some(target.to_path_buf());
        self.tree.add_upper(path, Source::symlink(target), attrs)?;
        Ok(())
    }

    fn dir(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        self.inner.dir(path, attrs)?;
        self.tree.add_upper(path, Rc::new(Source::Dir), attrs.clone())?;
        Ok(())
    }

    fn mkdir(&mut self, path: &Path) -> Result<()> {
        self.inner.mkdir(path)?;
        self.tree.mkdirs(path)?;
        Ok(())
    }

    fn fifo(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        self.inner.fifo(path, attrs)?;
        self.tree.add_upper(path, Rc::new(Source::Fifo), attrs.clone())?;
        Ok(())
    }

    fn device(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        self.inner.device(path, attrs)?;
        let device = attrs.device.ok_or_else(|| {
            Error::corrupt(format!("device {} without device numbers", path.display()))
        })?;
        self.tree
            .add_upper(path, Rc::new(Source::Device(device)), attrs.clone())?;
        Ok(())
    }

    fn whiteout(&mut self, path: &Path) -> Result<()> {
        self.inner.whiteout(path)?;
        // in the accumulated state a whiteout simply removes the node
        self.tree.remove(path)?;
        Ok(())
    }

    fn opaque(&mut self, path: &Path) -> Result<()> {
        self.inner.opaque(path)?;
        if let Ok(dir) = self.tree.node(path) {
            for child in self.tree.children(dir).to_vec() {
                self.tree.remove_child(dir, child);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records operations for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingWriter {
        pub ops: Vec<String>,
    }

    impl Writer for RecordingWriter {
        fn file(&mut self, path: &Path, _attrs: &FileAttrs, content: &mut dyn Read) -> Result<()> {
            let mut data = Vec::new();
            content.read_to_end(&mut data).ctx("read content")?;
            self.ops
                .push(format!("file {} {}b", path.display(), data.len()));
            Ok(())
        }

        fn hardlink(&mut self, path: &Path, target: &Path) -> Result<()> {
            self.ops
                .push(format!("hardlink {} -> {}", path.display(), target.display()));
            Ok(())
        }

        fn symlink(&mut self, path: &Path, target: &Path, _attrs: &FileAttrs) -> Result<()> {
            self.ops
                .push(format!("symlink {} -> {}", path.display(), target.display()));
            Ok(())
        }

        fn dir(&mut self, path: &Path, _attrs: &FileAttrs) -> Result<()> {
            self.ops.push(format!("dir {}", path.display()));
            Ok(())
        }

        fn mkdir(&mut self, path: &Path) -> Result<()> {
            self.ops.push(format!("mkdir {}", path.display()));
            Ok(())
        }

        fn fifo(&mut self, path: &Path, _attrs: &FileAttrs) -> Result<()> {
            self.ops.push(format!("fifo {}", path.display()));
            Ok(())
        }

        fn device(&mut self, path: &Path, _attrs: &FileAttrs) -> Result<()> {
            self.ops.push(format!("device {}", path.display()));
            Ok(())
        }

        fn whiteout(&mut self, path: &Path) -> Result<()> {
            self.ops.push(format!("whiteout {}", path.display()));
            Ok(())
        }

        fn opaque(&mut self, path: &Path) -> Result<()> {
            self.ops.push(format!("opaque {}", path.display()));
            Ok(())
        }
    }

    #[test]
    fn test_write_emits_hardlink_for_second_occurrence() {
        let mut tree = FsSpec::new();
        tree.add_upper("/a", Source::file_from_bytes(b"shared".to_vec()), FileAttrs::default())
            .unwrap();
        tree.link("/b", "/a").unwrap();

        let mut writer = RecordingWriter::default();
        tree.write(&mut writer).unwrap();
        assert_eq!(writer.ops, ["file /a 6b", "hardlink /b -> /a"]);
    }

    #[test]
    fn test_write_skips_lower_nodes() {
        let mut tree = FsSpec::new();
        tree.add_lower("/base/file", Source::file_from_bytes(vec![]), FileAttrs::default())
            .unwrap();
        tree.add_upper("/base/added", Source::file_from_bytes(b"x".to_vec()), FileAttrs::default())
            .unwrap();

        let mut writer = RecordingWriter::default();
        tree.write(&mut writer).unwrap();
        assert_eq!(writer.ops, ["mkdir /base", "file /base/added 1b"]);
    }

    #[test]
    fn test_write_whiteout() {
        let mut tree = FsSpec::new();
        tree.add_whiteout("/gone").unwrap();
        let mut writer = RecordingWriter::default();
        tree.write(&mut writer).unwrap();
        assert_eq!(writer.ops, ["whiteout /gone"]);
    }

    #[test]
    fn test_clean_rel_path() {
        assert_eq!(
            clean_rel_path(Path::new("./a//b/../c")).unwrap(),
            PathBuf::from("a/c")
        );
        assert_eq!(
            clean_rel_path(Path::new("/abs/path")).unwrap(),
            PathBuf::from("abs/path")
        );
        assert!(clean_rel_path(Path::new("../escape")).is_err());
        assert!(clean_rel_path(Path::new("a/../../escape")).is_err());
    }

    #[test]
    fn test_overlay_expansion() {
        // build a small tar on disk
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("overlay.tar");
        {
            let mut builder = tar::Builder::new(std::fs::File::create(&tar_path).unwrap());
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            builder.append_data(&mut header, "sub", std::io::empty()).unwrap();

            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, "sub/file.txt", &b"12345"[..])
                .unwrap();
            builder.finish().unwrap();
        }

        let mut tree = FsSpec::new();
        tree.add_upper(
            "/opt/unpacked",
            Rc::new(Source::TarOverlay(crate::fsspec::source::TarSource {
                path: tar_path,
                compression: Compression::None,
            })),
            FileAttrs::default_dir(),
        )
        .unwrap();
        // an explicit child overrides archive content
        tree.add_upper(
            "/opt/unpacked/extra",
            Source::file_from_bytes(b"yo".to_vec()),
            FileAttrs::default(),
        )
        .unwrap();

        let mut writer = RecordingWriter::default();
        tree.write(&mut writer).unwrap();
        assert_eq!(
            writer.ops,
            [
                "mkdir /opt",
                "dir /opt/unpacked",
                "dir /opt/unpacked/sub",
                "file /opt/unpacked/sub/file.txt 5b",
                "file /opt/unpacked/extra 2b",
            ]
        );
        // the overlay root only got one upper dir: /opt is a created parent
        assert!(writer.ops.iter().all(|op| !op.contains("file /opt/unpacked/sub/../")));
    }

    #[test]
    fn test_overlay_rejects_escaping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("evil.tar");
        {
            let mut builder = tar::Builder::new(std::fs::File::create(&tar_path).unwrap());
            let mut header = tar::Header::new_gnu();
            header.set_size(4);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, "../evil.txt", &b"boom"[..])
                .unwrap();
            builder.finish().unwrap();
        }

        let mut tree = FsSpec::new();
        tree.add_upper(
            "/target",
            Rc::new(Source::TarOverlay(crate::fsspec::source::TarSource {
                path: tar_path,
                compression: Compression::None,
            })),
            FileAttrs::default_dir(),
        )
        .unwrap();

        let mut writer = RecordingWriter::default();
        assert!(tree.write(&mut writer).is_err());
    }

    #[test]
    fn test_fsnode_writer_builds_tree() {
        let mut writer = FsNodeWriter::new(RecordingWriter::default(), None);
        writer
            .dir(Path::new("/d"), &FileAttrs::default_dir())
            .unwrap();
        writer
            .file(
                Path::new("/d/f"),
                &FileAttrs::with_mode(0o644),
                &mut &b"content"[..],
            )
            .unwrap();
        writer.hardlink(Path::new("/d/l"), Path::new("/d/f")).unwrap();
        writer.whiteout(Path::new("/d/f")).unwrap();

        let (_, tree) = writer.into_parts();
        // /d/f was whited out after being written
        assert!(tree.node("/d/f").is_err());
        let link = tree.node("/d/l").unwrap();
        assert_eq!(tree.attrs(link).size, Some(7));
        assert_eq!(
            tree.derived(link).hash,
            Some(Digest::sha256_of(b"content"))
        );
    }

    #[test]
    fn test_hashing_writer_records_digests() {
        let mut writer = HashingWriter::new(RecordingWriter::default());
        writer
            .file(
                Path::new("/x"),
                &FileAttrs::default(),
                &mut &b"hello"[..],
            )
            .unwrap();
        let (_, hashes) = writer.into_inner();
        assert_eq!(
            hashes.get(Path::new("/x")),
            Some(&(Digest::sha256_of(b"hello"), 5))
        );
    }
}
