//! Materializing an image's layers into a root filesystem.

use std::io::Read;
use std::path::Path;
use std::time::Instant;

use flate2::read::GzDecoder;
use oci_spec::image::MediaType;
use tracing::debug;

use vessel::blobstore::BlobStore;
use vessel::error::{Context, Error, Result};
use vessel::fsspec::{write_tar_entries, DirWriter, FsNodeWriter, Writer};
use vessel::idmap::IdMappings;
use vessel::snapshot::SnapshotStore;
use vessel::Digest;

use crate::store::read_manifest;

/// Unpack the layers of `manifest_digest` into `rootfs`.
///
/// Layers are gunzipped and streamed entry-by-entry through a [`DirWriter`]
/// (id-remapped, contained to the rootfs); whiteout entries remove content
/// from lower layers. The resulting state is captured as a snapshot and
/// persisted under the manifest digest so later commits can diff against it
/// without re-reading the layers.
///
/// On any failure, including a blown deadline, the partially unpacked
/// rootfs is removed.
pub fn unpack_rootfs(
    blobs: &BlobStore,
    snapshots: &SnapshotStore,
    mappings: &IdMappings,
    manifest_digest: &Digest,
    rootfs: &Path,
    deadline: Option<Instant>,
) -> Result<()> {
    let result = unpack_inner(blobs, snapshots, mappings, manifest_digest, rootfs, deadline);
    if result.is_err() && rootfs.exists() {
        debug!("removing partially unpacked rootfs {}", rootfs.display());
        let _ = std::fs::remove_dir_all(rootfs);
    }
    result.ctx("unpack image layers")
}

fn unpack_inner(
    blobs: &BlobStore,
    snapshots: &SnapshotStore,
    mappings: &IdMappings,
    manifest_digest: &Digest,
    rootfs: &Path,
    deadline: Option<Instant>,
) -> Result<()> {
    let manifest = read_manifest(blobs, manifest_digest)?;

    let dir_writer = DirWriter::new(rootfs, mappings.clone())?;
    let mut writer = FsNodeWriter::new(dir_writer, Some(rootfs.to_path_buf()));

    for descriptor in manifest.layers() {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    path: rootfs.to_path_buf(),
                    waited: std::time::Duration::ZERO,
                });
            }
        }
        let digest = crate::from_oci_digest(descriptor.digest())?;
        debug!(layer = %digest, "unpacking layer");
        let blob = blobs.read(&digest)?;
        let reader: Box<dyn Read> = match descriptor.media_type() {
            MediaType::ImageLayerGzip => Box::new(GzDecoder::new(blob)),
            MediaType::ImageLayer => Box::new(blob),
            other => {
                return Err(Error::corrupt(format!(
                    "unsupported layer media type {other}"
                )))
            }
        };
        write_tar_entries(reader, Path::new("/"), &mut writer)
            .with_ctx(|| format!("apply layer {digest}"))?;
    }
    writer.close()?;

    let (_, tree) = writer.into_parts();
    snapshots.put(manifest_digest, &tree)?;
    Ok(())
}
