//! Writing trees as OCI layer tar streams.
//!
//! Entry paths are cleaned and relative (a `..` that would escape the
//! archive root is an error), whiteouts become `.wh.<basename>` entries,
//! hardlinks reuse the attributes recorded when their target was written,
//! and xattrs travel as `SCHILY.xattr.*` PAX records. Absolute symlink
//! targets are rewritten relative to the archive root so the layer extracts
//! correctly under any prefix.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tar::{EntryType, Header};

use crate::error::{Context, Error, Result};
use crate::fsspec::attrs::{DeviceKind, FileAttrs};
use crate::fsspec::writer::{clean_rel_path, Writer};

/// Writes tree operations into a tar stream.
pub struct TarWriter<W: Write> {
    builder: tar::Builder<W>,
    /// Attributes of already written entries, for hardlink reuse.
    written: HashMap<PathBuf, FileAttrs>,
}

impl<W: Write> TarWriter<W> {
    pub fn new(out: W) -> Self {
        TarWriter {
            builder: tar::Builder::new(out),
            written: HashMap::new(),
        }
    }

    /// Finish the archive and hand back the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.builder.finish().ctx("finish archive")?;
        self.builder.into_inner().ctx("flush archive")
    }

    fn rel(path: &Path) -> Result<PathBuf> {
        let rel = clean_rel_path(path)?;
        if rel.as_os_str().is_empty() {
            return Err(Error::invalid_input("cannot write the archive root"));
        }
        Ok(rel)
    }

    fn base_header(attrs: &FileAttrs, entry_type: EntryType, default_mode: u32) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(attrs.mode_or(default_mode));
        header.set_uid(attrs.uid_or_root() as u64);
        header.set_gid(attrs.gid_or_root() as u64);
        header.set_mtime(attrs.mtime.unwrap_or(0).max(0) as u64);
        header.set_size(0);
        header
    }

    /// Emit xattrs as a PAX extended header for the entry that follows.
    fn append_xattrs(&mut self, rel: &Path, attrs: &FileAttrs) -> Result<()> {
        if attrs.xattrs.is_empty() {
            return Ok(());
        }
        let mut data = Vec::new();
        for (key, value) in &attrs.xattrs {
            let mut record = Vec::new();
            record.extend_from_slice(b"SCHILY.xattr.");
            record.extend_from_slice(key.as_bytes());
            record.push(b'=');
            record.extend_from_slice(value);
            record.push(b'\n');
            // the record length prefix counts itself
            let content_len = record.len() + 1; // leading space
            let mut total = content_len + 1;
            while total != content_len + decimal_len(total) {
                total = content_len + decimal_len(total);
            }
            data.extend_from_slice(total.to_string().as_bytes());
            data.push(b' ');
            data.extend_from_slice(&record);
        }

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::XHeader);
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        let pax_name = PathBuf::from("PaxHeaders.0").join(rel);
        self.builder
            .append_data(&mut header, pax_name, &data[..])
            .ctx("write pax header")
    }
}

fn decimal_len(mut n: usize) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

/// Rewrite an absolute symlink target relative to the archive root.
fn relativize_target(target: &Path, link_rel: &Path) -> PathBuf {
    if !target.is_absolute() {
        return target.to_path_buf();
    }
    let target_parts: Vec<_> = target
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect();
    let parent_parts: Vec<_> = link_rel
        .parent()
        .unwrap_or(Path::new(""))
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect();

    let common = target_parts
        .iter()
        .zip(&parent_parts)
        .take_while(|(a, b)| *a == *b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..parent_parts.len() {
        rel.push("..");
    }
    for part in &target_parts[common..] {
        rel.push(part);
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

impl<W: Write> Writer for TarWriter<W> {
    fn file(&mut self, path: &Path, attrs: &FileAttrs, content: &mut dyn Read) -> Result<()> {
        let rel = Self::rel(path)?;
        self.append_xattrs(&rel, attrs)?;
        let mut header = Self::base_header(attrs, EntryType::Regular, 0o644);
        header.set_size(attrs.size.unwrap_or(0));

        if attrs.size.is_some() {
            self.builder
                .append_data(&mut header, &rel, content)
                .with_ctx(|| format!("write archive entry {}", rel.display()))?;
        } else {
            // size unknown: buffer to learn it, tar needs it up front
            let mut data = Vec::new();
            content.read_to_end(&mut data).ctx("read file content")?;
            header.set_size(data.len() as u64);
            self.builder
                .append_data(&mut header, &rel, &data[..])
                .with_ctx(|| format!("write archive entry {}", rel.display()))?;
        }
        self.written.insert(path.to_path_buf(), attrs.clone());
        Ok(())
    }

    fn hardlink(&mut self, path: &Path, target: &Path) -> Result<()> {
        let rel = Self::rel(path)?;
        let target_rel = Self::rel(target)?;
        let attrs = self
            .written
            .get(target)
            .ok_or_else(|| {
                Error::invalid_input(format!(
                    "hardlink target {} was not written to this archive",
                    target.display()
                ))
            })?
            .clone();

        let mut header = Self::base_header(&attrs, EntryType::Link, 0o644);
        self.builder
            .append_link(&mut header, &rel, &target_rel)
            .with_ctx(|| format!("write hardlink entry {}", rel.display()))
    }

    fn symlink(&mut self, path: &Path, target: &Path, attrs: &FileAttrs) -> Result<()> {
        let rel = Self::rel(path)?;
        let target = relativize_target(target, &rel);
        let mut header = Self::base_header(attrs, EntryType::Symlink, 0o777);
        self.builder
            .append_link(&mut header, &rel, &target)
            .with_ctx(|| format!("write symlink entry {}", rel.display()))
    }

    fn dir(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        let rel = Self::rel(path)?;
        self.append_xattrs(&rel, attrs)?;
        let mut header = Self::base_header(attrs, EntryType::Directory, 0o755);
        self.builder
            .append_data(&mut header, &rel, std::io::empty())
            .with_ctx(|| format!("write directory entry {}", rel.display()))
    }

    fn mkdir(&mut self, path: &Path) -> Result<()> {
        self.dir(path, &FileAttrs::default_dir())
    }

    fn fifo(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        let rel = Self::rel(path)?;
        let mut header = Self::base_header(attrs, EntryType::Fifo, 0o644);
        self.builder
            .append_data(&mut header, &rel, std::io::empty())
            .with_ctx(|| format!("write fifo entry {}", rel.display()))
    }

    fn device(&mut self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        let rel = Self::rel(path)?;
        let device = attrs.device.ok_or_else(|| {
            Error::corrupt(format!("device {} without device numbers", path.display()))
        })?;
        let entry_type = match device.kind {
            DeviceKind::Block => EntryType::Block,
            DeviceKind::Char => EntryType::Char,
        };
        let mut header = Self::base_header(attrs, entry_type, 0o644);
        header
            .set_device_major(device.major)
            .ctx("set device major")?;
        header
            .set_device_minor(device.minor)
            .ctx("set device minor")?;
        self.builder
            .append_data(&mut header, &rel, std::io::empty())
            .with_ctx(|| format!("write device entry {}", rel.display()))
    }

    fn whiteout(&mut self, path: &Path) -> Result<()> {
        let rel = Self::rel(path)?;
        let name = rel
            .file_name()
            .ok_or_else(|| Error::invalid_input("whiteout path has no name"))?;
        let mut whiteout_name = std::ffi::OsString::from(".wh.");
        whiteout_name.push(name);
        let entry = rel.with_file_name(whiteout_name);

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(0);
        header.set_mtime(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );
        self.builder
            .append_data(&mut header, &entry, std::io::empty())
            .with_ctx(|| format!("write whiteout entry {}", entry.display()))
    }

    fn opaque(&mut self, path: &Path) -> Result<()> {
        let rel = Self::rel(path)?;
        let entry = rel.join(".wh..wh..opq");
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(0);
        self.builder
            .append_data(&mut header, &entry, std::io::empty())
            .with_ctx(|| format!("write opaque entry {}", entry.display()))
    }

    fn close(&mut self) -> Result<()> {
        self.builder.finish().ctx("finish archive")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsspec::node::FsSpec;
    use crate::fsspec::source::Source;
    use std::rc::Rc;

    fn entries(data: &[u8]) -> Vec<(String, EntryType, String)> {
        let mut archive = tar::Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let link = e
                    .link_name()
                    .unwrap()
                    .map(|l| l.display().to_string())
                    .unwrap_or_default();
                (
                    e.path().unwrap().display().to_string(),
                    e.header().entry_type(),
                    link,
                )
            })
            .collect()
    }

    #[test]
    fn test_file_and_hardlink_entries() {
        let mut tree = FsSpec::new();
        let src = Source::file_from_bytes(b"shared".to_vec());
        tree.add_upper("/a", Rc::clone(&src), {
            let mut a = FileAttrs::with_mode(0o644);
            a.size = Some(6);
            a.mtime = Some(100);
            a
        })
        .unwrap();
        tree.link("/b", "/a").unwrap();

        let mut writer = TarWriter::new(Vec::new());
        tree.write(&mut writer).unwrap();
        let data = writer.into_inner().unwrap();

        let found = entries(&data);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], ("a".into(), EntryType::Regular, String::new()));
        assert_eq!(found[1], ("b".into(), EntryType::Link, "a".into()));
    }

    #[test]
    fn test_whiteout_entry_name() {
        let mut tree = FsSpec::new();
        tree.mkdirs("/etc").unwrap();
        tree.add_whiteout("/etc/passwd").unwrap();

        let mut writer = TarWriter::new(Vec::new());
        tree.write(&mut writer).unwrap();
        let data = writer.into_inner().unwrap();

        let names: Vec<String> = entries(&data).into_iter().map(|(n, _, _)| n).collect();
        assert!(names.contains(&"etc/.wh.passwd".to_string()), "{names:?}");
    }

    #[test]
    fn test_absolute_symlink_relativized() {
        let mut writer = TarWriter::new(Vec::new());
        writer
            .symlink(
                Path::new("/usr/bin/vi"),
                Path::new("/usr/lib/editor"),
                &FileAttrs::default(),
            )
            .unwrap();
        writer.close().unwrap();
        let data = writer.into_inner().unwrap();

        let found = entries(&data);
        assert_eq!(found[0].2, "../lib/editor");
    }

    #[test]
    fn test_relative_symlink_preserved() {
        let mut writer = TarWriter::new(Vec::new());
        writer
            .symlink(Path::new("/l"), Path::new("sibling"), &FileAttrs::default())
            .unwrap();
        let data = writer.into_inner().unwrap();
        assert_eq!(entries(&data)[0].2, "sibling");
    }

    #[test]
    fn test_xattrs_roundtrip_via_pax() {
        let mut attrs = FileAttrs::with_mode(0o644);
        attrs.size = Some(2);
        attrs
            .xattrs
            .insert("user.test".into(), b"some value".to_vec());

        let mut writer = TarWriter::new(Vec::new());
        writer
            .file(Path::new("/x"), &attrs, &mut &b"ab"[..])
            .unwrap();
        let data = writer.into_inner().unwrap();

        let mut archive = tar::Archive::new(&data[..]);
        let mut found = None;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.header().entry_type() == EntryType::Regular {
                if let Some(exts) = entry.pax_extensions().unwrap() {
                    for ext in exts {
                        let ext = ext.unwrap();
                        if ext.key().unwrap() == "SCHILY.xattr.user.test" {
                            found = Some(ext.value_bytes().to_vec());
                        }
                    }
                }
            }
        }
        assert_eq!(found.as_deref(), Some(&b"some value"[..]));
    }

    #[test]
    fn test_hardlink_requires_written_target() {
        let mut writer = TarWriter::new(Vec::new());
        assert!(writer
            .hardlink(Path::new("/b"), Path::new("/never-written"))
            .is_err());
    }

    #[test]
    fn test_escaping_path_rejected() {
        let mut writer = TarWriter::new(Vec::new());
        assert!(writer
            .file(
                Path::new("/../escape"),
                &FileAttrs::default(),
                &mut std::io::empty()
            )
            .is_err());
    }
}
