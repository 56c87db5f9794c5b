//! The aggregate image store.
//!
//! Combines the blob store, snapshot store, image-id index and per-name
//! repositories behind one directory:
//!
//! ```text
//! <store>/blobs/<algo>/<hex>          content-addressed blobs
//! <store>/.fsspec/<algo>/<hex>        rootfs snapshots per manifest
//! <store>/image-ids/<algo>-<hex>      image id -> manifest digest
//! <store>/image-repos/<base64-name>/  per-name OCI layout + index.json
//! <store>/.lock/                      store-wide shared/exclusive lock
//! ```
//!
//! Reads take the store-wide shared lock; writers hold a shared lock for
//! their lifetime plus per-repo exclusive locks while mutating an index;
//! garbage collection takes the exclusive lock and is therefore serialized
//! against everything else.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use oci_spec::image::{Arch, ImageConfiguration, ImageManifest, MediaType, Os};
use rustix::process::geteuid;
use tracing::debug;

use vessel::blobstore::BlobStore;
use vessel::error::{Context, Error, Result};
use vessel::idmap::IdMappings;
use vessel::lock::LockDir;
use vessel::snapshot::SnapshotStore;
use vessel::Digest;

use crate::commit::{commit_layer, ConfigUpdate};
use crate::imageid::ImageIdStore;
use crate::import::TrustPolicy;
use crate::repo::{self, ImageRepo};

pub(crate) const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// A resolved image: identity plus its parsed manifest and config.
#[derive(Debug, Clone)]
pub struct Image {
    /// Repository name, `None` for untagged images.
    pub name: Option<String>,
    /// Tag within the repository, `None` for untagged images.
    pub reference: Option<String>,
    /// The image id (config digest).
    pub id: Digest,
    pub manifest_digest: Digest,
    pub manifest: ImageManifest,
    pub config: ImageConfiguration,
    pub last_used: SystemTime,
}

impl Image {
    /// Total compressed size of the image's layers.
    pub fn size(&self) -> u64 {
        self.manifest.layers().iter().map(|l| l.size()).sum()
    }

    /// `name:ref` when tagged.
    pub fn name_ref(&self) -> Option<String> {
        match (&self.name, &self.reference) {
            (Some(name), Some(reference)) => Some(format!("{name}:{reference}")),
            _ => None,
        }
    }
}

/// The store handle; cheap to clone paths, no open file state.
#[derive(Debug)]
pub struct ImageStore {
    dir: PathBuf,
    blobs: BlobStore,
    snapshots: SnapshotStore,
    image_ids: ImageIdStore,
    locks: LockDir,
    mappings: IdMappings,
    trust: TrustPolicy,
    lock_timeout: Duration,
}

impl ImageStore {
    /// Open (creating if necessary) the store at `dir`.
    ///
    /// The id mapping defaults to the single-id rootless map when not
    /// running as root, the identity map otherwise.
    pub fn open(dir: impl Into<PathBuf>, trust: TrustPolicy) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            // a rootless store is private to its owner
            std::fs::create_dir_all(&dir)
                .with_ctx(|| format!("create store directory {}", dir.display()))?;
            let mut perms = std::fs::metadata(&dir).ctx("stat store directory")?.permissions();
            std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o700);
            std::fs::set_permissions(&dir, perms).ctx("restrict store directory")?;
        }

        let mappings = if geteuid().is_root() {
            IdMappings::identity()
        } else {
            IdMappings::rootless()
        };

        Ok(ImageStore {
            blobs: BlobStore::open(dir.join("blobs"))?,
            snapshots: SnapshotStore::open(dir.join(".fsspec"))?,
            image_ids: ImageIdStore::open(dir.join("image-ids"))?,
            locks: LockDir::open(dir.join(".lock"))?,
            mappings,
            trust,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            dir,
        })
    }

    pub fn with_id_mappings(mut self, mappings: IdMappings) -> Self {
        self.mappings = mappings;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn id_mappings(&self) -> &IdMappings {
        &self.mappings
    }

    pub(crate) fn image_ids(&self) -> &ImageIdStore {
        &self.image_ids
    }

    pub(crate) fn trust(&self) -> &TrustPolicy {
        &self.trust
    }

    pub(crate) fn repos_dir(&self) -> PathBuf {
        self.dir.join("image-repos")
    }

    /// Look up an image by id (config digest).
    pub fn image(&self, id: &Digest) -> Result<Image> {
        let _shared = self.locks.shared(self.lock_timeout)?;
        self.image_locked(id)
    }

    fn image_locked(&self, id: &Digest) -> Result<Image> {
        let entries = self.image_ids.list()?;
        let entry = entries
            .into_iter()
            .find(|e| e.image_id == *id)
            .ok_or_else(|| Error::not_found(format!("image {id}")))?;
        let (manifest, config) = self.load_manifest_and_config(&entry.manifest_digest)?;
        let (name, reference) = self
            .tags_by_manifest()?
            .remove(&entry.manifest_digest)
            .map(|(n, r)| (Some(n), Some(r)))
            .unwrap_or((None, None));
        Ok(Image {
            name,
            reference,
            id: entry.image_id,
            manifest_digest: entry.manifest_digest,
            manifest,
            config,
            last_used: entry.last_used,
        })
    }

    /// Look up an image by `<name>[:<ref>]`, or by digest string.
    pub fn image_by_name(&self, name_ref: &str) -> Result<Image> {
        if let Ok(id) = Digest::parse(name_ref) {
            return self.image(&id);
        }
        let _shared = self.locks.shared(self.lock_timeout)?;
        let (name, reference) = split_name_ref(name_ref)?;

        let index_path = self.repos_dir().join(repo::encode_name(&name)).join("index.json");
        let data = match std::fs::read(&index_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("image {name:?}")))
            }
            Err(e) => return Err(e).with_ctx(|| format!("read index of {name:?}")),
        };
        let index: oci_spec::image::ImageIndex = serde_json::from_slice(&data)
            .map_err(|e| Error::corrupt(format!("index.json of {name:?}: {e}")))?;

        let (arch, os) = (Arch::default(), Os::default());
        let descriptor = index
            .manifests()
            .iter()
            .filter(|d| ImageRepo::ref_of(d) == Some(reference.as_str()))
            .find(|d| match d.platform() {
                Some(p) => *p.architecture() == arch && *p.os() == os,
                None => true,
            })
            .ok_or_else(|| Error::not_found(format!("image {name}:{reference}")))?;

        let manifest_digest = crate::from_oci_digest(descriptor.digest())?;
        let (manifest, config) = self.load_manifest_and_config(&manifest_digest)?;
        let id = crate::from_oci_digest(manifest.config().digest())?;
        let last_used = self
            .image_ids
            .list()?
            .into_iter()
            .find(|e| e.image_id == id)
            .map(|e| e.last_used)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        Ok(Image {
            name: Some(name),
            reference: Some(reference),
            id,
            manifest_digest,
            manifest,
            config,
            last_used,
        })
    }

    /// All images, tagged and untagged, sorted by name/ref with untagged
    /// images last. Unreadable entries are skipped.
    pub fn images(&self) -> Result<Vec<Image>> {
        let _shared = self.locks.shared(self.lock_timeout)?;
        let tags = self.tags_by_manifest()?;

        let mut images = Vec::new();
        for entry in self.image_ids.list()? {
            let (manifest, config) = match self.load_manifest_and_config(&entry.manifest_digest) {
                Ok(parts) => parts,
                Err(e) => {
                    debug!("skipping unreadable image {}: {e}", entry.image_id);
                    continue;
                }
            };
            let (name, reference) = tags
                .get(&entry.manifest_digest)
                .map(|(n, r)| (Some(n.clone()), Some(r.clone())))
                .unwrap_or((None, None));
            images.push(Image {
                name,
                reference,
                id: entry.image_id,
                manifest_digest: entry.manifest_digest,
                manifest,
                config,
                last_used: entry.last_used,
            });
        }
        images.sort_by(|a, b| {
            let key = |i: &Image| (i.name.is_none(), i.name.clone(), i.reference.clone());
            key(a).cmp(&key(b))
        });
        Ok(images)
    }

    /// Bump an image's last-used time.
    pub fn mark_image_used(&self, id: &Digest) -> Result<()> {
        let _shared = self.locks.shared(self.lock_timeout)?;
        self.image_ids.mark_used(id)
    }

    /// Open a write handle. The handle holds the store-wide shared lock for
    /// its lifetime.
    pub fn read_write(&self) -> Result<ImageStoreRW<'_>> {
        let shared = self.locks.shared(self.lock_timeout)?;
        Ok(ImageStoreRW {
            store: self,
            _shared: shared,
        })
    }

    /// Remove images whose last-used time predates `before` and that no
    /// repository references, then drop every blob and snapshot that is no
    /// longer reachable. Serialized against all readers and writers.
    pub fn image_gc(&self, before: SystemTime) -> Result<GcStats> {
        let _exclusive = self.locks.exclusive(self.lock_timeout)?;

        let referenced: HashSet<Digest> =
            self.tags_by_manifest()?.keys().cloned().collect();

        let mut stats = GcStats::default();
        let mut keep_manifests: HashSet<Digest> = referenced.clone();
        for entry in self.image_ids.list()? {
            if referenced.contains(&entry.manifest_digest) || entry.last_used >= before {
                keep_manifests.insert(entry.manifest_digest);
                stats.kept_images += 1;
            } else {
                debug!("garbage collecting image {}", entry.image_id);
                self.image_ids.remove(&entry.image_id)?;
                stats.removed_images += 1;
            }
        }

        let mut keep_blobs = HashSet::new();
        for manifest_digest in &keep_manifests {
            keep_blobs.insert(manifest_digest.clone());
            let manifest = match read_manifest(&self.blobs, manifest_digest) {
                Ok(manifest) => manifest,
                Err(e) => {
                    debug!("keeping unreadable manifest {manifest_digest}: {e}");
                    continue;
                }
            };
            keep_blobs.insert(crate::from_oci_digest(manifest.config().digest())?);
            for layer in manifest.layers() {
                keep_blobs.insert(crate::from_oci_digest(layer.digest())?);
            }
        }

        self.blobs.retain(&keep_blobs)?;
        self.snapshots.retain(&keep_manifests)?;
        Ok(stats)
    }

    /// Map of manifest digest → (name, ref) across every repository.
    fn tags_by_manifest(&self) -> Result<HashMap<Digest, (String, String)>> {
        let mut tags = HashMap::new();
        let repos_dir = self.repos_dir();
        let entries = match std::fs::read_dir(&repos_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tags),
            Err(e) => return Err(e).ctx("read image-repos directory"),
        };
        for entry in entries {
            let entry = entry.ctx("read image-repos directory")?;
            let file_name = entry.file_name();
            let Some(encoded) = file_name.to_str() else { continue };
            if encoded.ends_with(".lock") || !entry.path().is_dir() {
                continue;
            }
            let Ok(name) = repo::decode_name(encoded) else {
                debug!("skipping undecodable repository directory {encoded:?}");
                continue;
            };
            let index_path = entry.path().join("index.json");
            let Ok(data) = std::fs::read(&index_path) else {
                continue;
            };
            let Ok(index) = serde_json::from_slice::<oci_spec::image::ImageIndex>(&data) else {
                debug!("skipping unparseable index of {name:?}");
                continue;
            };
            for descriptor in index.manifests() {
                if let (Some(reference), Ok(digest)) = (
                    ImageRepo::ref_of(descriptor),
                    crate::from_oci_digest(descriptor.digest()),
                ) {
                    tags.insert(digest, (name.clone(), reference.to_string()));
                }
            }
        }
        Ok(tags)
    }

    fn load_manifest_and_config(
        &self,
        manifest_digest: &Digest,
    ) -> Result<(ImageManifest, ImageConfiguration)> {
        let manifest = read_manifest(&self.blobs, manifest_digest)?;
        let config = read_config(&self.blobs, &crate::from_oci_digest(manifest.config().digest())?)?;
        Ok((manifest, config))
    }
}

/// What a garbage collection removed and kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub removed_images: usize,
    pub kept_images: usize,
}

/// A write handle on the store.
pub struct ImageStoreRW<'a> {
    store: &'a ImageStore,
    _shared: vessel::lock::SharedLock,
}

impl<'a> ImageStoreRW<'a> {
    pub fn store(&self) -> &ImageStore {
        self.store
    }

    /// Commit the state of `rootfs` as a new layer on top of
    /// `parent_manifest`, optionally tagging the result as `name_ref`.
    pub fn commit_image(
        &self,
        rootfs: &Path,
        name_ref: Option<&str>,
        parent_manifest: Option<&Digest>,
        author: &str,
        comment: &str,
    ) -> Result<Image> {
        self.commit_image_with(rootfs, name_ref, parent_manifest, author, comment, None)
    }

    /// Like [`ImageStoreRW::commit_image`] with staged config changes.
    pub fn commit_image_with(
        &self,
        rootfs: &Path,
        name_ref: Option<&str>,
        parent_manifest: Option<&Digest>,
        author: &str,
        comment: &str,
        update: Option<&ConfigUpdate>,
    ) -> Result<Image> {
        let outcome = commit_layer(
            &self.store.blobs,
            &self.store.snapshots,
            &self.store.mappings,
            rootfs,
            parent_manifest,
            author,
            comment,
            update,
        )
        .ctx("commit")?;

        self.store
            .image_ids
            .add(&outcome.image_id, &outcome.manifest_digest)?;

        let (name, reference) = match name_ref {
            Some(name_ref) => {
                let (name, reference) = split_name_ref(name_ref)?;
                self.tag_manifest(&outcome.manifest_digest, outcome.manifest_size, &name, &reference, &[])?;
                (Some(name), Some(reference))
            }
            None => (None, None),
        };

        Ok(Image {
            name,
            reference,
            id: outcome.image_id,
            manifest_digest: outcome.manifest_digest,
            manifest: outcome.manifest,
            config: outcome.config,
            last_used: SystemTime::now(),
        })
    }

    /// Tag an existing manifest under `<name>[:<ref>]`.
    pub fn tag(&self, manifest_digest: &Digest, name_ref: &str) -> Result<Image> {
        let (name, reference) = split_name_ref(name_ref)?;
        let size = self.store.blobs.stat(manifest_digest)?.len();
        self.tag_manifest(manifest_digest, size, &name, &reference, &[])?;

        let (manifest, config) = self.store.load_manifest_and_config(manifest_digest)?;
        let id = crate::from_oci_digest(manifest.config().digest())?;
        self.store.image_ids.add(&id, manifest_digest)?;
        Ok(Image {
            name: Some(name),
            reference: Some(reference),
            id,
            manifest_digest: manifest_digest.clone(),
            manifest,
            config,
            last_used: SystemTime::now(),
        })
    }

    pub(crate) fn tag_manifest(
        &self,
        manifest_digest: &Digest,
        manifest_size: u64,
        name: &str,
        reference: &str,
        extra_annotations: &[(&str, &str)],
    ) -> Result<()> {
        let descriptor = repo::ref_descriptor(
            manifest_digest,
            manifest_size,
            reference,
            Arch::default(),
            Os::default(),
            extra_annotations,
        )?;
        let mut repo = ImageRepo::open(
            &self.store.repos_dir(),
            name,
            Some(self.store.blobs.root()),
            true,
            self.store.lock_timeout,
        )?;
        repo.add_ref(descriptor)?;
        repo.close()
    }

    /// Remove the tag `<name>[:<ref>]`. The image itself stays until GC.
    pub fn untag(&self, name_ref: &str) -> Result<()> {
        let (name, reference) = split_name_ref(name_ref)?;
        let mut repo = ImageRepo::open(
            &self.store.repos_dir(),
            &name,
            Some(self.store.blobs.root()),
            false,
            self.store.lock_timeout,
        )?;
        repo.del_ref(&reference)?;
        repo.close()
    }

    /// Import an image from a transport reference (e.g. `docker://…`),
    /// gated by the store's trust policy.
    pub fn import_image(&self, transport_ref: &str) -> Result<Vec<Image>> {
        crate::import::import(self, transport_ref)
    }
}

/// Split `<name>[:<ref>]`, defaulting the ref to `latest`. The split is at
/// the last colon after the last slash so registry ports survive.
pub fn split_name_ref(name_ref: &str) -> Result<(String, String)> {
    if name_ref.is_empty() {
        return Err(Error::invalid_input("empty image name"));
    }
    let split_at = match name_ref.rfind('/') {
        Some(slash) => name_ref[slash..].rfind(':').map(|c| slash + c),
        None => name_ref.rfind(':'),
    };
    let (name, reference) = match split_at {
        Some(colon) => (&name_ref[..colon], &name_ref[colon + 1..]),
        None => (name_ref, "latest"),
    };
    if name.is_empty() || reference.is_empty() {
        return Err(Error::invalid_input(format!("malformed image name {name_ref:?}")));
    }
    Ok((name.to_string(), reference.to_string()))
}

/// Read and validate an image manifest blob.
pub(crate) fn read_manifest(blobs: &BlobStore, digest: &Digest) -> Result<ImageManifest> {
    let data = blobs.read_to_vec(digest)?;
    let manifest: ImageManifest = serde_json::from_slice(&data)
        .map_err(|e| Error::corrupt(format!("manifest {digest}: {e}")))?;
    if let Some(media_type) = manifest.media_type() {
        if *media_type != MediaType::ImageManifest {
            return Err(Error::corrupt(format!(
                "unsupported manifest media type {media_type}"
            )));
        }
    }
    Ok(manifest)
}

/// Read an image config blob.
pub(crate) fn read_config(blobs: &BlobStore, digest: &Digest) -> Result<ImageConfiguration> {
    let data = blobs.read_to_vec(digest)?;
    serde_json::from_slice(&data).map_err(|e| Error::corrupt(format!("config {digest}: {e}")))
}
