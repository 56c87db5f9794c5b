//! High-level image building.
//!
//! An [`ImageBuilder`] takes a base image, stages filesystem operations as a
//! tree and config changes as a [`ConfigUpdate`], and turns each
//! commit into a new layer plus a tagged (or untagged) image. The working
//! rootfs lives in a private directory inside the store and is removed when
//! the builder drops.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use vessel::error::{Context, Result};
use vessel::fsspec::{DirWriter, FileAttrs, FsSpec, Source};
use vessel::util::generate_tmpname;

use crate::commit::ConfigUpdate;
use crate::store::{Image, ImageStore, ImageStoreRW};
use crate::unpack::unpack_rootfs;

pub struct ImageBuilder {
    work_dir: PathBuf,
    tree: FsSpec,
    config: ConfigUpdate,
    base: Option<Image>,
    author: String,
}

impl ImageBuilder {
    /// Create a builder working inside `store`'s directory.
    pub fn new(store: &ImageStore, author: &str) -> Result<Self> {
        let work_dir = store.dir().join(generate_tmpname(".build-"));
        std::fs::create_dir(&work_dir)
            .with_ctx(|| format!("create build directory {}", work_dir.display()))?;
        Ok(ImageBuilder {
            work_dir,
            tree: FsSpec::new(),
            config: ConfigUpdate::default(),
            base: None,
            author: author.to_string(),
        })
    }

    fn rootfs_dir(&self) -> PathBuf {
        self.work_dir.join("rootfs")
    }

    /// The image the next commit will layer on top of.
    pub fn base(&self) -> Option<&Image> {
        self.base.as_ref()
    }

    /// Start from an existing image: its rootfs becomes the working rootfs.
    pub fn from_image(&mut self, store: &ImageStore, name_or_id: &str) -> Result<&Image> {
        let image = store.image_by_name(name_or_id)?;
        let rootfs = self.rootfs_dir();
        if rootfs.exists() {
            std::fs::remove_dir_all(&rootfs)
                .with_ctx(|| format!("reset build rootfs {}", rootfs.display()))?;
        }
        unpack_rootfs(
            store.blobs(),
            store.snapshots(),
            store.id_mappings(),
            &image.manifest_digest,
            &rootfs,
            None,
        )?;
        debug!(image = %image.id, "build base unpacked");
        self.base = Some(image);
        Ok(self.base.as_ref().expect("base just set"))
    }

    // filesystem staging

    pub fn add(
        &mut self,
        dest: impl AsRef<Path>,
        source: Rc<Source>,
        attrs: FileAttrs,
    ) -> Result<()> {
        self.tree.add_upper(dest, source, attrs)?;
        Ok(())
    }

    pub fn mkdirs(&mut self, dest: impl AsRef<Path>) -> Result<()> {
        self.tree.mkdirs(dest)?;
        Ok(())
    }

    pub fn link(&mut self, dest: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<()> {
        self.tree.link(dest, target)?;
        Ok(())
    }

    pub fn remove(&mut self, dest: impl AsRef<Path>) -> Result<()> {
        self.tree.add_whiteout(dest)?;
        Ok(())
    }

    // config staging

    pub fn set_entrypoint(&mut self, entrypoint: Vec<String>) {
        self.config.entrypoint = Some(entrypoint);
    }

    pub fn set_cmd(&mut self, cmd: Vec<String>) {
        self.config.cmd = Some(cmd);
    }

    pub fn add_env(&mut self, env: impl Into<String>) {
        self.config.env.push(env.into());
    }

    pub fn add_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config.labels.insert(key.into(), value.into());
    }

    pub fn set_user(&mut self, user: impl Into<String>) {
        self.config.user = Some(user.into());
    }

    pub fn set_working_dir(&mut self, dir: impl Into<String>) {
        self.config.working_dir = Some(dir.into());
    }

    pub fn expose_port(&mut self, port: impl Into<String>) {
        self.config.exposed_ports.push(port.into());
    }

    pub fn set_stop_signal(&mut self, signal: impl Into<String>) {
        self.config.stop_signal = Some(signal.into());
    }

    /// Apply the staged tree to the working rootfs and commit the result as
    /// a new layer, optionally tagging it. The committed image becomes the
    /// base for further operations.
    pub fn commit(
        &mut self,
        rw: &ImageStoreRW<'_>,
        name_ref: Option<&str>,
        comment: &str,
    ) -> Result<Image> {
        let rootfs = self.rootfs_dir();
        std::fs::create_dir_all(&rootfs)
            .with_ctx(|| format!("create build rootfs {}", rootfs.display()))?;

        if !self.tree.is_empty() {
            let mut writer =
                DirWriter::new(&rootfs, rw.store().id_mappings().clone())?;
            self.tree.write(&mut writer).ctx("apply staged changes")?;
        }

        let parent = self.base.as_ref().map(|i| i.manifest_digest.clone());
        let update = (!self.config.is_empty()).then_some(&self.config);
        let image = rw.commit_image_with(
            &rootfs,
            name_ref,
            parent.as_ref(),
            &self.author,
            comment,
            update,
        )?;

        self.tree = FsSpec::new();
        self.config = ConfigUpdate::default();
        self.base = Some(image.clone());
        Ok(image)
    }

    /// Tag the current base image under another name.
    pub fn tag(&self, rw: &ImageStoreRW<'_>, name_ref: &str) -> Result<Image> {
        let base = self
            .base
            .as_ref()
            .ok_or_else(|| vessel::Error::invalid_input("no image to tag yet"))?;
        rw.tag(&base.manifest_digest, name_ref)
    }
}

impl Drop for ImageBuilder {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.work_dir);
    }
}
