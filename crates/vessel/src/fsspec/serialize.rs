//! Textual tree serialization.
//!
//! One node per line: the percent-encoded node name followed by
//! space-separated `key=value` attributes. A directory line opens a context
//! for its children and a lone `..` line closes it; the root is the `.` line.
//! A `<name> hlink=<target>` line denotes a hardlink to an earlier node.
//!
//! The format round-trips through [`FsSpec::parse_spec`] modulo the attribute
//! projection chosen at write time, and is the canonical form fed to the
//! tree hash.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;
use std::rc::Rc;

use crate::digest::Digest;
use crate::error::{Context, Error, Result};
use crate::fsspec::attrs::{AttrSet, DeviceKind, DeviceNum, FileAttrs, HttpInfo};
use crate::fsspec::node::{FsSpec, NodeId, NodeKind};
use crate::fsspec::source::{underlying, Compression, FileOrigin, FileSource, Source, TarSource};
use crate::util::DigestWriter;

fn pe(bytes: &[u8]) -> String {
    urlencoding::encode_binary(bytes).into_owned()
}

fn pe_os(s: &OsStr) -> String {
    pe(s.as_bytes())
}

fn pd(s: &str) -> Vec<u8> {
    urlencoding::decode_binary(s.as_bytes()).into_owned()
}

fn type_name(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Dir => "dir",
        NodeKind::File => "file",
        NodeKind::Symlink => "symlink",
        NodeKind::Device => "dev",
        NodeKind::Fifo => "fifo",
        NodeKind::Overlay => "overlay",
        NodeKind::Whiteout => "whiteout",
    }
}

fn http_value(info: &HttpInfo) -> String {
    let mut parts = Vec::new();
    if let Some(etag) = &info.etag {
        parts.push(format!("etag={etag}"));
    }
    if let Some(lm) = &info.last_modified {
        parts.push(format!("last-modified={lm}"));
    }
    if let Some(len) = info.content_length {
        parts.push(format!("content-length={len}"));
    }
    pe(parts.join(",").as_bytes())
}

fn parse_http_value(value: &str) -> Result<HttpInfo> {
    let decoded = String::from_utf8(pd(value))
        .map_err(|_| Error::corrupt("http attribute is not UTF-8"))?;
    let mut info = HttpInfo::default();
    for part in decoded.split(',').filter(|p| !p.is_empty()) {
        let (key, val) = part
            .split_once('=')
            .ok_or_else(|| Error::corrupt(format!("malformed http attribute part {part:?}")))?;
        match key {
            "etag" => info.etag = Some(val.to_string()),
            "last-modified" => info.last_modified = Some(val.to_string()),
            "content-length" => {
                info.content_length = Some(
                    val.parse()
                        .map_err(|_| Error::corrupt("malformed content-length"))?,
                )
            }
            _ => {}
        }
    }
    Ok(info)
}

impl FsSpec {
    /// Serialize the tree, projecting attributes through `attrs`.
    pub fn write_to(&self, out: &mut impl Write, attrs: &AttrSet) -> Result<()> {
        let mut hardlinks: HashMap<*const Source, PathBuf> = HashMap::new();
        self.write_node(self.root(), out, attrs, &mut hardlinks)
    }

    /// The SHA-256 digest of the canonical serialized form.
    pub fn hash(&self, attrs: &AttrSet) -> Result<Digest> {
        let mut writer = DigestWriter::new(std::io::sink());
        self.write_to(&mut writer, attrs)?;
        let (_, digest, _) = writer.finalize();
        Ok(digest)
    }

    fn write_node(
        &self,
        id: NodeId,
        out: &mut impl Write,
        attrs: &AttrSet,
        hardlinks: &mut HashMap<*const Source, PathBuf>,
    ) -> Result<()> {
        let is_root = self.parent(id).is_none();
        let name = if is_root {
            ".".to_string()
        } else {
            pe_os(self.name(id))
        };
        let kind = self.kind(id);

        // second occurrence of a shared source serializes as a hardlink
        if !kind.is_dir_like() && kind != NodeKind::Whiteout {
            let key = Rc::as_ptr(underlying(self.source(id)));
            if let Some(target) = hardlinks.get(&key) {
                writeln!(out, "{name} hlink={}", pe_os(target.as_os_str()))
                    .ctx("write spec line")?;
                return Ok(());
            }
            hardlinks.insert(key, self.path_of(id));
        }

        let mut line = format!("{name} type={}", type_name(kind));
        let fa = self.attrs(id);
        if attrs.mode {
            if let Some(mode) = fa.mode {
                line.push_str(&format!(" mode={mode:o}"));
            }
        }
        if attrs.usr {
            if let (Some(uid), Some(gid)) = (fa.uid, fa.gid) {
                line.push_str(&format!(" usr={uid}:{gid}"));
            }
        }
        if attrs.size {
            if let Some(size) = fa.size {
                line.push_str(&format!(" size={size}"));
            }
        }
        if let Some(dev) = fa.device {
            let kind_char = match dev.kind {
                DeviceKind::Block => 'b',
                DeviceKind::Char => 'c',
            };
            line.push_str(&format!(" dev={kind_char}:{}:{}", dev.major, dev.minor));
        }
        if let Some(target) = &fa.link_target {
            line.push_str(&format!(" link={}", pe_os(target.as_os_str())));
        }
        if attrs.mtime {
            if let Some(mtime) = fa.mtime {
                line.push_str(&format!(" mtime={mtime}"));
            }
        }
        if attrs.atime {
            if let Some(atime) = fa.atime {
                line.push_str(&format!(" atime={atime}"));
            }
        }
        let derived = self.derived(id);
        if attrs.hash {
            if let Some(hash) = &derived.hash {
                line.push_str(&format!(" hash={hash}"));
            }
        }
        if attrs.url {
            if let Some(url) = &derived.url {
                line.push_str(&format!(" url={url}"));
            }
        }
        if attrs.http {
            if let Some(http) = &derived.http {
                line.push_str(&format!(" http={}", http_value(http)));
            }
        }
        if attrs.xattrs {
            for (key, value) in &fa.xattrs {
                line.push_str(&format!(" xattr.{}={}", pe_os(key), pe(value)));
            }
        }
        writeln!(out, "{line}").ctx("write spec line")?;

        if kind.is_dir_like() {
            for child in self.children(id).to_vec() {
                self.write_node(child, out, attrs, hardlinks)?;
            }
            writeln!(out, "..").ctx("write spec line")?;
        }
        Ok(())
    }

    /// Parse a serialized tree back into an [`FsSpec`].
    ///
    /// File nodes come back with opaque sources: their identity is the
    /// recorded hash, not readable bytes.
    pub fn parse_spec(input: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(input)
            .map_err(|_| Error::corrupt("spec serialization is not UTF-8"))?;
        let mut tree = FsSpec::new();
        // stack of open directory paths; the root is pushed by the "." line
        let mut stack: Vec<PathBuf> = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let fail =
                |msg: &str| Error::corrupt(format!("spec line {}: {msg}", lineno + 1));

            if line == ".." {
                if stack.pop().is_none() {
                    return Err(fail("unbalanced directory close"));
                }
                continue;
            }

            let mut tokens = line.split_ascii_whitespace();
            let raw_name = tokens.next().ok_or_else(|| fail("missing node name"))?;
            let attrs: Vec<&str> = tokens.collect();

            if stack.is_empty() {
                if raw_name != "." {
                    return Err(fail("serialization must begin with the root entry"));
                }
                let (fa, derived, _kind_attr) = parse_attrs(&attrs, &fail)?;
                *tree.attrs_mut(tree.root()) = fa;
                *tree.derived_mut(tree.root()) = derived;
                stack.push(PathBuf::from("/"));
                continue;
            }

            let name = OsString::from_vec(pd(raw_name));
            let cwd = stack.last().expect("stack non-empty").clone();
            let path = cwd.join(&name);

            // hardlink lines carry only the target
            if let Some(target_attr) = attrs.iter().find_map(|a| a.strip_prefix("hlink=")) {
                let target = PathBuf::from(OsString::from_vec(pd(target_attr)));
                tree.link(&path, &target)
                    .with_ctx(|| format!("spec line {}", lineno + 1))?;
                continue;
            }

            let (fa, derived, kind_attr) = parse_attrs(&attrs, &fail)?;
            let kind_attr = kind_attr.ok_or_else(|| fail("missing type attribute"))?;
            let source = source_for(&kind_attr, &fa, &fail)?;
            let is_dir_like = matches!(kind_attr.as_str(), "dir" | "overlay");

            let id = tree
                .add_upper(&path, source, fa)
                .with_ctx(|| format!("spec line {}", lineno + 1))?;
            *tree.derived_mut(id) = derived;

            if is_dir_like {
                stack.push(path);
            }
        }
        Ok(tree)
    }
}

type ParsedAttrs = (FileAttrs, crate::fsspec::attrs::DerivedAttrs, Option<String>);

fn parse_attrs(attrs: &[&str], fail: &dyn Fn(&str) -> Error) -> Result<ParsedAttrs> {
    let mut fa = FileAttrs::default();
    let mut derived = crate::fsspec::attrs::DerivedAttrs::default();
    let mut kind = None;

    for attr in attrs {
        let (key, value) = attr
            .split_once('=')
            .ok_or_else(|| fail(&format!("malformed attribute {attr:?}")))?;
        match key {
            "type" => kind = Some(value.to_string()),
            "mode" => {
                fa.mode = Some(
                    u32::from_str_radix(value, 8).map_err(|_| fail("malformed mode"))?,
                )
            }
            "usr" => {
                let (uid, gid) = value
                    .split_once(':')
                    .ok_or_else(|| fail("malformed usr attribute"))?;
                fa.uid = Some(uid.parse().map_err(|_| fail("malformed uid"))?);
                fa.gid = Some(gid.parse().map_err(|_| fail("malformed gid"))?);
            }
            "size" => fa.size = Some(value.parse().map_err(|_| fail("malformed size"))?),
            "dev" => {
                let mut parts = value.splitn(3, ':');
                let kind_char = parts.next().unwrap_or("");
                let major = parts.next().unwrap_or("");
                let minor = parts.next().unwrap_or("");
                fa.device = Some(DeviceNum {
                    kind: match kind_char {
                        "b" => DeviceKind::Block,
                        "c" => DeviceKind::Char,
                        _ => return Err(fail("malformed dev attribute")),
                    },
                    major: major.parse().map_err(|_| fail("malformed dev major"))?,
                    minor: minor.parse().map_err(|_| fail("malformed dev minor"))?,
                });
            }
            "link" => fa.link_target = Some(PathBuf::from(OsString::from_vec(pd(value)))),
            "mtime" => fa.mtime = Some(value.parse().map_err(|_| fail("malformed mtime"))?),
            "atime" => fa.atime = Some(value.parse().map_err(|_| fail("malformed atime"))?),
            "hash" => derived.hash = Some(Digest::parse(value)?),
            "url" => derived.url = Some(value.to_string()),
            "http" => derived.http = Some(parse_http_value(value)?),
            _ => {
                if let Some(xattr_key) = key.strip_prefix("xattr.") {
                    fa.xattrs.insert(OsString::from_vec(pd(xattr_key)), pd(value));
                }
                // unknown keys are ignored for forward compatibility
            }
        }
    }
    Ok((fa, derived, kind))
}

fn source_for(kind: &str, fa: &FileAttrs, fail: &dyn Fn(&str) -> Error) -> Result<Rc<Source>> {
    Ok(match kind {
        "dir" => Rc::new(Source::Dir),
        "file" => Rc::new(Source::File(FileSource {
            origin: FileOrigin::Opaque,
        })),
        "symlink" => {
            let target = fa
                .link_target
                .clone()
                .ok_or_else(|| fail("symlink without link attribute"))?;
            Rc::new(Source::Symlink(target))
        }
        "fifo" => Rc::new(Source::Fifo),
        "dev" => Rc::new(Source::Device(
            fa.device.ok_or_else(|| fail("device without dev attribute"))?,
        )),
        "overlay" => Rc::new(Source::TarOverlay(TarSource {
            path: PathBuf::new(),
            compression: Compression::None,
        })),
        "whiteout" => Rc::new(Source::Whiteout),
        other => return Err(fail(&format!("unknown node type {other:?}"))),
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::fsspec::attrs::DeviceKind;

    fn sample_tree() -> FsSpec {
        let mut tree = FsSpec::new();
        let file = Source::file_from_bytes(b"hello\n".to_vec());
        let id = tree
            .add_upper("/etc/motd", Rc::clone(&file), {
                let mut a = FileAttrs::with_mode(0o644);
                a.uid = Some(0);
                a.gid = Some(0);
                a.size = Some(6);
                a.mtime = Some(1234);
                a.xattrs
                    .insert("user.note".into(), b"a value with spaces".to_vec());
                a
            })
            .unwrap();
        tree.derived_mut(id).hash = Some(Digest::sha256_of(b"hello\n"));
        tree.link("/etc/motd-link", "/etc/motd").unwrap();
        tree.add_upper("/bin/sh", Source::symlink("/usr/bin/dash"), {
            let mut a = FileAttrs::with_mode(0o777);
            a.link_target = Some(PathBuf::from("/usr/bin/dash"));
            a
        })
        .unwrap();
        tree.add_upper(
            "/dev/null",
            Rc::new(Source::Device(DeviceNum {
                kind: DeviceKind::Char,
                major: 1,
                minor: 3,
            })),
            {
                let mut a = FileAttrs::with_mode(0o666);
                a.device = Some(DeviceNum {
                    kind: DeviceKind::Char,
                    major: 1,
                    minor: 3,
                });
                a
            },
        )
        .unwrap();
        tree.add_whiteout("/removed").unwrap();
        tree
    }

    fn roundtrip(tree: &FsSpec) -> FsSpec {
        let mut buf = Vec::new();
        tree.write_to(&mut buf, &AttrSet::COMPARE).unwrap();
        FsSpec::parse_spec(&buf).unwrap()
    }

    #[test]
    fn test_roundtrip_preserves_serialization() {
        let tree = sample_tree();
        let reparsed = roundtrip(&tree);

        let mut first = Vec::new();
        tree.write_to(&mut first, &AttrSet::COMPARE).unwrap();
        let mut second = Vec::new();
        reparsed.write_to(&mut second, &AttrSet::COMPARE).unwrap();
        assert_eq!(
            String::from_utf8(first).unwrap(),
            String::from_utf8(second).unwrap()
        );
    }

    #[test]
    fn test_roundtrip_preserves_hash() {
        let tree = sample_tree();
        let reparsed = roundtrip(&tree);
        assert_eq!(
            tree.hash(&AttrSet::COMPARE).unwrap(),
            reparsed.hash(&AttrSet::COMPARE).unwrap()
        );
    }

    #[test]
    fn test_hardlink_line() {
        let tree = sample_tree();
        let mut buf = Vec::new();
        tree.write_to(&mut buf, &AttrSet::COMPARE).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(
            text.contains("motd-link hlink=%2Fetc%2Fmotd"),
            "serialized form:\n{text}"
        );

        let reparsed = FsSpec::parse_spec(text.as_bytes()).unwrap();
        let link = reparsed.node("/etc/motd-link").unwrap();
        assert!(reparsed.is_hardlink(link));
    }

    #[test]
    fn test_names_with_spaces_roundtrip() {
        let mut tree = FsSpec::new();
        tree.add_upper(
            "/dir with space/a=b",
            Source::file_from_bytes(vec![]),
            FileAttrs::with_mode(0o600),
        )
        .unwrap();
        let reparsed = roundtrip(&tree);
        assert!(reparsed.node("/dir with space/a=b").is_ok());
    }

    #[test]
    fn test_projection_drops_attrs() {
        let mut tree = FsSpec::new();
        let id = tree
            .add_upper("/f", Source::file_from_bytes(vec![]), {
                let mut a = FileAttrs::with_mode(0o644);
                a.atime = Some(999);
                a
            })
            .unwrap();
        tree.derived_mut(id).http = Some(HttpInfo {
            etag: Some("\"x\"".into()),
            last_modified: None,
            content_length: None,
        });

        let mut buf = Vec::new();
        tree.write_to(&mut buf, &AttrSet::COMPARE).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("atime="));
        assert!(!text.contains("http="));

        let mut buf = Vec::new();
        tree.write_to(&mut buf, &AttrSet::ALL).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("atime=999"));
        assert!(text.contains("http="));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(FsSpec::parse_spec(b"/not-root type=file\n").is_err());
        assert!(FsSpec::parse_spec(b". type=dir\nx type=unknowable\n..\n").is_err());
        assert!(FsSpec::parse_spec(b". type=dir\n..\n..\n").is_err());
    }

    #[test]
    fn test_http_roundtrip() {
        let info = HttpInfo {
            etag: Some("\"abc\"".to_string()),
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
            content_length: Some(42),
        };
        let parsed = parse_http_value(&http_value(&info)).unwrap();
        assert_eq!(parsed, info);
    }
}
