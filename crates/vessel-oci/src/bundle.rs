//! Bundles: runnable rootfs directories with a runtime config.
//!
//! A bundle lives at `<store>/bundles/<id>/` next to its `<id>.lock` file
//! and contains `config.json` (the OCI runtime spec), `rootfs/` (the
//! unpacked image) and optionally `rootfs.image` (the image id the rootfs
//! was materialized from). The bundle directory's mtime is its last-used
//! time; GC removes bundles that outlived their TTL, re-checking under the
//! per-bundle lock and asking the container runtime's store for permission.

use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use oci_spec::runtime::{RootBuilder, Spec};
use tracing::debug;

use vessel::atomic;
use vessel::error::{Context, Error, ErrorKind, Result};
use vessel::lock::PathLock;
use vessel::Digest;

use crate::store::{Image, ImageStore};
use crate::unpack::unpack_rootfs;
use crate::{oci_err, BUNDLE_ID_ANNOTATION};

/// What the bundle GC asks before deleting a bundle: does a runtime
/// container still hold it?
pub trait ContainerStore {
    fn exists(&self, id: &str) -> Result<bool>;
}

/// A [`ContainerStore`] for setups without a runtime attached.
pub struct NoContainers;

impl ContainerStore for NoContainers {
    fn exists(&self, _id: &str) -> Result<bool> {
        Ok(false)
    }
}

/// The store of bundles under one directory.
#[derive(Debug, Clone)]
pub struct BundleStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

/// An unlocked, read-only view of a bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    dir: PathBuf,
    id: String,
}

/// A bundle held under its exclusive lock.
#[derive(Debug)]
pub struct LockedBundle {
    bundle: Bundle,
    spec: Option<Spec>,
    _lock: PathLock,
}

impl BundleStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_ctx(|| format!("create bundle directory {}", dir.display()))?;
        Ok(BundleStore {
            dir,
            lock_timeout: crate::store::DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn bundle_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }

    /// Create (or, with `update`, reopen) the bundle `id` under its lock.
    ///
    /// Creating an existing bundle without `update` fails with
    /// `AlreadyExists` and leaves the bundle untouched.
    pub fn create_bundle(&self, id: &str, update: bool) -> Result<LockedBundle> {
        validate_id(id)?;
        let lock = PathLock::lock(self.lock_path(id), self.lock_timeout)?;
        let dir = self.bundle_dir(id);

        let spec = if dir.exists() {
            if !update {
                return Err(Error::already_exists(format!("bundle {id:?}")));
            }
            touch(&dir)?;
            None // an existing config.json is loaded lazily
        } else {
            std::fs::DirBuilder::new()
                .mode(0o770)
                .create(&dir)
                .with_ctx(|| format!("create bundle {id:?}"))?;
            Some(default_spec(id)?)
        };

        Ok(LockedBundle {
            bundle: Bundle {
                dir,
                id: id.to_string(),
            },
            spec,
            _lock: lock,
        })
    }

    /// Lock an existing bundle.
    pub fn open_bundle(&self, id: &str) -> Result<LockedBundle> {
        validate_id(id)?;
        let lock = PathLock::lock(self.lock_path(id), self.lock_timeout)?;
        let dir = self.bundle_dir(id);
        if !dir.is_dir() {
            return Err(Error::not_found(format!("bundle {id:?}")));
        }
        Ok(LockedBundle {
            bundle: Bundle {
                dir,
                id: id.to_string(),
            },
            spec: None,
            _lock: lock,
        })
    }

    /// A read-only view of a bundle, without locking.
    pub fn bundle(&self, id: &str) -> Result<Bundle> {
        validate_id(id)?;
        let dir = self.bundle_dir(id);
        if !dir.is_dir() {
            return Err(Error::not_found(format!("bundle {id:?}")));
        }
        Ok(Bundle {
            dir,
            id: id.to_string(),
        })
    }

    /// Every bundle in the store; unreadable entries are skipped.
    pub fn bundles(&self) -> Result<Vec<Bundle>> {
        let mut bundles = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_ctx(|| format!("read bundle directory {}", self.dir.display()))?;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("skipping unreadable bundle entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                debug!("skipping bundle with non-UTF8 name");
                continue;
            };
            bundles.push(Bundle {
                dir: entry.path(),
                id,
            });
        }
        bundles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bundles)
    }

    /// Delete bundles unused for longer than `ttl`.
    ///
    /// Each candidate is re-checked under its lock (a touch may have raced
    /// us) and the container store gets a veto. Returns the removed ids.
    pub fn bundle_gc(
        &self,
        ttl: Duration,
        containers: &dyn ContainerStore,
    ) -> Result<Vec<String>> {
        let now = SystemTime::now();
        let expired = |bundle: &Bundle| -> bool {
            let last = bundle.last_used().unwrap_or(SystemTime::UNIX_EPOCH);
            now.duration_since(last).unwrap_or_default() > ttl
        };

        let mut removed = Vec::new();
        for bundle in self.bundles()? {
            if !expired(&bundle) {
                continue;
            }
            // a held lock means the bundle is in active use
            let lock = match PathLock::lock(self.lock_path(&bundle.id), Duration::from_millis(100))
            {
                Ok(lock) => lock,
                Err(e) if e.kind() == ErrorKind::Timeout => {
                    debug!("skipping locked bundle {:?}", bundle.id);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !expired(&bundle) {
                continue;
            }
            if containers.exists(&bundle.id)? {
                debug!("skipping bundle {:?} held by a container", bundle.id);
                continue;
            }
            remove_tree(&bundle.dir)?;
            drop(lock);
            removed.push(bundle.id);
        }
        Ok(removed)
    }
}

impl Bundle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.dir.join("rootfs")
    }

    /// Last-used time: the bundle directory's mtime.
    pub fn last_used(&self) -> Result<SystemTime> {
        std::fs::metadata(&self.dir)
            .and_then(|m| m.modified())
            .with_ctx(|| format!("stat bundle {:?}", self.id))
    }

    /// The image id the rootfs was materialized from, if recorded.
    pub fn image(&self) -> Result<Option<Digest>> {
        match std::fs::read_to_string(self.dir.join("rootfs.image")) {
            Ok(content) => Ok(Some(Digest::parse(content.trim())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_ctx(|| format!("read parent image of bundle {:?}", self.id)),
        }
    }
}

impl LockedBundle {
    pub fn id(&self) -> &str {
        &self.bundle.id
    }

    pub fn dir(&self) -> &Path {
        &self.bundle.dir
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.bundle.rootfs_dir()
    }

    pub fn as_bundle(&self) -> &Bundle {
        &self.bundle
    }

    /// The runtime spec: `config.json` if present, the default otherwise.
    pub fn spec(&mut self) -> Result<&Spec> {
        if self.spec.is_none() {
            let path = self.bundle.dir.join("config.json");
            self.spec = Some(if path.exists() {
                Spec::load(&path)
                    .map_err(|e| Error::corrupt(format!("config.json of {:?}: {e}", self.bundle.id)))?
            } else {
                default_spec(&self.bundle.id)?
            });
        }
        Ok(self.spec.as_ref().expect("spec just loaded"))
    }

    /// Validate and persist a runtime spec as the bundle's `config.json`.
    ///
    /// Bind-mount sources must resolve inside the bundle directory; sources
    /// that don't exist yet are created.
    pub fn set_spec(&mut self, spec: Spec) -> Result<()> {
        self.validate_mounts(&spec)?;
        atomic::write_json(self.bundle.dir.join("config.json"), &spec)
            .with_ctx(|| format!("write config.json of {:?}", self.bundle.id))?;
        self.spec = Some(spec);
        Ok(())
    }

    fn validate_mounts(&self, spec: &Spec) -> Result<()> {
        let Some(mounts) = spec.mounts() else {
            return Ok(());
        };
        for mount in mounts {
            let is_bind = mount.typ().as_deref() == Some("bind")
                || mount
                    .options()
                    .as_ref()
                    .map(|opts| opts.iter().any(|o| o == "bind" || o == "rbind"))
                    .unwrap_or(false);
            if !is_bind {
                continue;
            }
            let Some(source) = mount.source() else {
                continue;
            };
            let absolute = if source.is_relative() {
                self.bundle.dir.join(source)
            } else {
                source.clone()
            };
            let cleaned = lexical_clean(&absolute);
            if !cleaned.starts_with(&self.bundle.dir) {
                return Err(Error::invalid_input(format!(
                    "bind mount source {} is outside the bundle directory",
                    source.display()
                )));
            }
            std::fs::create_dir_all(&cleaned)
                .with_ctx(|| format!("create bind mount source {}", cleaned.display()))?;
        }
        Ok(())
    }

    /// See [`Bundle::image`].
    pub fn image(&self) -> Result<Option<Digest>> {
        self.bundle.image()
    }

    /// Record (or clear) the image id the rootfs came from.
    pub fn set_parent_image_id(&self, id: Option<&Digest>) -> Result<()> {
        let path = self.bundle.dir.join("rootfs.image");
        match id {
            Some(id) => atomic::write_file(&path, id.to_string().as_bytes()),
            None => atomic::remove_if_exists(&path),
        }
    }

    /// Materialize `image` into the bundle's rootfs.
    ///
    /// A no-op when the recorded parent image already matches; otherwise the
    /// old rootfs is deleted and the image's layers are unpacked in its
    /// place.
    pub fn update_rootfs(&mut self, store: &ImageStore, image: &Image) -> Result<()> {
        if self.image()? == Some(image.id.clone()) {
            debug!("bundle {:?} already holds image {}", self.bundle.id, image.id);
            return Ok(());
        }
        let rootfs = self.rootfs_dir();
        if rootfs.exists() {
            remove_tree(&rootfs)?;
        }
        self.set_parent_image_id(None)?;
        unpack_rootfs(
            store.blobs(),
            store.snapshots(),
            store.id_mappings(),
            &image.manifest_digest,
            &rootfs,
            None,
        )?;
        self.set_parent_image_id(Some(&image.id))?;
        if let Err(e) = store.image_ids().mark_used(&image.id) {
            debug!("cannot mark image {} used: {e}", image.id);
        }
        Ok(())
    }

    /// Delete the bundle entirely.
    pub fn delete(self) -> Result<()> {
        remove_tree(&self.bundle.dir)
        // the lock file disappears when the lock drops
    }

    /// Persist a never-written spec, reset the expiry clock and release the
    /// lock.
    pub fn close(mut self) -> Result<()> {
        if !self.bundle.dir.join("config.json").exists() {
            let spec = self.spec()?.clone();
            self.set_spec(spec)?;
        }
        touch(&self.bundle.dir)
    }
}

fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 200
        && !id.starts_with('.')
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
    if !valid {
        return Err(Error::invalid_input(format!("invalid bundle id {id:?}")));
    }
    Ok(())
}

fn default_spec(id: &str) -> Result<Spec> {
    let mut spec = Spec::default();
    spec.set_root(Some(
        RootBuilder::default()
            .path("rootfs")
            .readonly(false)
            .build()
            .map_err(oci_err)?,
    ));
    let mut annotations = spec.annotations().clone().unwrap_or_default();
    annotations.insert(BUNDLE_ID_ANNOTATION.to_string(), id.to_string());
    spec.set_annotations(Some(annotations));
    Ok(spec)
}

fn touch(dir: &Path) -> Result<()> {
    let now = FileTime::from_system_time(SystemTime::now());
    filetime::set_file_times(dir, now, now)
        .with_ctx(|| format!("touch {}", dir.display()))
}

/// Resolve `.` and `..` lexically, clamping at the filesystem root.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Remove a directory tree, recovering from unreadable permission modes by
/// re-opening directories before retrying — rootless bundles may contain
/// directories with no owner access bits.
fn remove_tree(path: &Path) -> Result<()> {
    if std::fs::remove_dir_all(path).is_ok() {
        return Ok(());
    }
    restore_dir_access(path);
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_ctx(|| format!("remove {}", path.display())),
    }
}

fn restore_dir_access(path: &Path) {
    if path.is_dir() {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    restore_dir_access(&entry.path());
                }
            }
        }
    }
}
