//! Per-name image repositories.
//!
//! Every image name owns one directory under `image-repos/`, named by the
//! RawStd base64 encoding of the name. The directory is a minimal OCI layout:
//! an `oci-layout` version file, an `index.json` whose entries carry the tag
//! in the standard `org.opencontainers.image.ref.name` annotation, and a
//! `blobs` symlink into the store's shared blob directory.
//!
//! A repo handle holds the per-repo lock for its whole lifetime; ref
//! mutations happen in memory and are only made visible by an atomic
//! `index.json` replacement on [`ImageRepo::close`]. A repo whose last ref
//! is deleted disappears entirely.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use oci_spec::image::{
    Arch, Descriptor, DescriptorBuilder, ImageIndex, ImageIndexBuilder, MediaType, OciLayout,
    OciLayoutBuilder, Os,
};
use tracing::debug;

use vessel::atomic;
use vessel::error::{Context, Error, Result};
use vessel::lock::PathLock;

use crate::{oci_err, REF_NAME_ANNOTATION};

const LAYOUT_VERSION: &str = "1.0.0";

/// Encode an image name as its repo directory name.
pub fn encode_name(name: &str) -> String {
    STANDARD_NO_PAD.encode(name.as_bytes())
}

/// Decode a repo directory name back to the image name.
pub fn decode_name(encoded: &str) -> Result<String> {
    let bytes = STANDARD_NO_PAD
        .decode(encoded.as_bytes())
        .map_err(|_| Error::corrupt(format!("repo directory {encoded:?} is not base64")))?;
    String::from_utf8(bytes)
        .map_err(|_| Error::corrupt(format!("repo directory {encoded:?} is not UTF-8")))
}

/// An open, locked image repository.
#[derive(Debug)]
pub struct ImageRepo {
    dir: PathBuf,
    name: String,
    manifests: Vec<Descriptor>,
    _lock: PathLock,
}

impl ImageRepo {
    /// Open the repository for `name`, taking its exclusive lock.
    ///
    /// With `create` the directory skeleton is initialized if missing;
    /// without it a missing repo is `NotFound`.
    pub fn open(
        repos_dir: &Path,
        name: &str,
        shared_blob_dir: Option<&Path>,
        create: bool,
        lock_timeout: Duration,
    ) -> Result<Self> {
        std::fs::create_dir_all(repos_dir)
            .with_ctx(|| format!("create repo directory {}", repos_dir.display()))?;
        let dir = repos_dir.join(encode_name(name));
        let lock = PathLock::lock(repos_dir.join(format!("{}.lock", encode_name(name))), lock_timeout)?;

        if !dir.exists() {
            if !create {
                return Err(Error::not_found(format!("image repository {name:?}")));
            }
            std::fs::create_dir(&dir)
                .with_ctx(|| format!("create repository {}", dir.display()))?;
        }

        Self::ensure_layout(&dir)?;
        Self::ensure_blob_dir(&dir, shared_blob_dir)?;
        let manifests = Self::load_index(&dir)?;

        Ok(ImageRepo {
            dir,
            name: name.to_string(),
            manifests,
            _lock: lock,
        })
    }

    fn ensure_layout(dir: &Path) -> Result<()> {
        let path = dir.join("oci-layout");
        match std::fs::read(&path) {
            Ok(data) => {
                let layout: OciLayout = serde_json::from_slice(&data)
                    .map_err(|e| Error::corrupt(format!("oci-layout: {e}")))?;
                if layout.image_layout_version() != LAYOUT_VERSION {
                    return Err(Error::corrupt(format!(
                        "unknown oci-layout version {:?}",
                        layout.image_layout_version()
                    )));
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let layout = OciLayoutBuilder::default()
                    .image_layout_version(LAYOUT_VERSION.to_string())
                    .build()
                    .map_err(oci_err)?;
                atomic::write_json(&path, &layout)
            }
            Err(e) => Err(e).ctx("read oci-layout"),
        }
    }

    fn ensure_blob_dir(dir: &Path, shared: Option<&Path>) -> Result<()> {
        let blobs = dir.join("blobs");
        if std::fs::symlink_metadata(&blobs).is_ok() {
            return Ok(());
        }
        match shared {
            Some(target) => std::os::unix::fs::symlink(target, &blobs)
                .with_ctx(|| format!("symlink {}", blobs.display())),
            None => std::fs::create_dir(&blobs)
                .with_ctx(|| format!("create {}", blobs.display())),
        }
    }

    fn load_index(dir: &Path) -> Result<Vec<Descriptor>> {
        let path = dir.join("index.json");
        match std::fs::read(&path) {
            Ok(data) => {
                let index: ImageIndex = serde_json::from_slice(&data)
                    .map_err(|e| Error::corrupt(format!("index.json: {e}")))?;
                if index.schema_version() != 2 {
                    return Err(Error::corrupt(format!(
                        "unsupported index schema version {}",
                        index.schema_version()
                    )));
                }
                Ok(index.manifests().clone())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).ctx("read index.json"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manifests(&self) -> &[Descriptor] {
        &self.manifests
    }

    /// The tag recorded on a descriptor.
    pub fn ref_of(descriptor: &Descriptor) -> Option<&str> {
        descriptor
            .annotations()
            .as_ref()
            .and_then(|a| a.get(REF_NAME_ANNOTATION))
            .map(String::as_str)
    }

    /// Find the descriptor for `ref_name` matching the current platform.
    pub fn find_ref(&self, ref_name: &str) -> Option<&Descriptor> {
        let (arch, os) = (Arch::default(), Os::default());
        self.manifests
            .iter()
            .filter(|d| Self::ref_of(d) == Some(ref_name))
            .find(|d| match d.platform() {
                Some(platform) => *platform.architecture() == arch && *platform.os() == os,
                None => true,
            })
    }

    /// Add a descriptor, replacing any existing entry with the same
    /// `(ref, architecture, os)` key. The descriptor must carry a ref
    /// annotation.
    pub fn add_ref(&mut self, descriptor: Descriptor) -> Result<()> {
        let Some(ref_name) = Self::ref_of(&descriptor).map(str::to_string) else {
            return Err(Error::invalid_input(
                "descriptor has no ref annotation",
            ));
        };
        let platform_key = |d: &Descriptor| {
            d.platform()
                .as_ref()
                .map(|p| (p.architecture().clone(), p.os().clone()))
        };
        let key = platform_key(&descriptor);
        self.manifests
            .retain(|d| !(Self::ref_of(d) == Some(ref_name.as_str()) && platform_key(d) == key));
        self.manifests.push(descriptor);
        Ok(())
    }

    /// Remove the descriptor(s) for a ref; `NotFound` if no entry matched.
    pub fn del_ref(&mut self, ref_name: &str) -> Result<Vec<Descriptor>> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.manifests)
            .into_iter()
            .partition(|d| Self::ref_of(d) == Some(ref_name));
        self.manifests = kept;
        if removed.is_empty() {
            return Err(Error::not_found(format!(
                "ref {:?} in repository {:?}",
                ref_name, self.name
            )));
        }
        Ok(removed)
    }

    /// Persist the accumulated state: rewrite `index.json` atomically, or
    /// remove the whole repository if no refs remain.
    pub fn close(self) -> Result<()> {
        if self.manifests.is_empty() {
            debug!("removing empty repository {:?}", self.name);
            return std::fs::remove_dir_all(&self.dir)
                .with_ctx(|| format!("remove repository {}", self.dir.display()));
        }
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(self.manifests.clone())
            .build()
            .map_err(oci_err)?;
        atomic::write_json(self.dir.join("index.json"), &index)
            .with_ctx(|| format!("update image index for {:?}", self.name))
    }
}

/// Build a manifest descriptor carrying a ref annotation and platform.
pub fn ref_descriptor(
    manifest_digest: &vessel::Digest,
    size: u64,
    ref_name: &str,
    arch: Arch,
    os: Os,
    extra_annotations: &[(&str, &str)],
) -> Result<Descriptor> {
    let mut annotations: HashMap<String, String> =
        [(REF_NAME_ANNOTATION.to_string(), ref_name.to_string())].into();
    for (key, value) in extra_annotations {
        annotations.insert((*key).to_string(), (*value).to_string());
    }
    let platform = oci_spec::image::PlatformBuilder::default()
        .architecture(arch)
        .os(os)
        .build()
        .map_err(oci_err)?;
    DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(crate::to_oci_digest(manifest_digest)?)
        .size(size)
        .annotations(annotations)
        .platform(platform)
        .build()
        .map_err(oci_err)
}
