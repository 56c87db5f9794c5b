//! The commit pipeline: live rootfs → new layer, config and manifest.

use std::collections::HashMap;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use oci_spec::image::{
    Arch, Config, ConfigBuilder, DescriptorBuilder, HistoryBuilder, ImageConfiguration,
    ImageConfigurationBuilder, ImageManifest, ImageManifestBuilder, MediaType, Os, RootFsBuilder,
};
use tracing::debug;

use vessel::blobstore::BlobStore;
use vessel::error::{Context, Error, Result};
use vessel::fsspec::{FsSpec, TarWriter};
use vessel::idmap::IdMappings;
use vessel::snapshot::{snapshot, SnapshotStore};
use vessel::Digest;

use crate::oci_err;
use crate::store::{read_config, read_manifest};

/// Staged changes to the container section of the image config.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    /// Appended to the inherited environment.
    pub env: Vec<String>,
    /// Merged over the inherited labels.
    pub labels: HashMap<String, String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub exposed_ports: Vec<String>,
    pub stop_signal: Option<String>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.entrypoint.is_none()
            && self.cmd.is_none()
            && self.env.is_empty()
            && self.labels.is_empty()
            && self.user.is_none()
            && self.working_dir.is_none()
            && self.exposed_ports.is_empty()
            && self.stop_signal.is_none()
    }
}

/// Everything a successful commit produced.
pub(crate) struct CommitOutcome {
    pub manifest_digest: Digest,
    pub manifest_size: u64,
    pub manifest: ImageManifest,
    pub image_id: Digest,
    pub config: ImageConfiguration,
}

/// Diff `rootfs` against its parent and write the resulting layer, config
/// and manifest blobs. The new snapshot is persisted under the new manifest
/// digest; stray blobs from an interrupted run are reclaimed by GC.
#[allow(clippy::too_many_arguments)]
pub(crate) fn commit_layer(
    blobs: &BlobStore,
    snapshots: &SnapshotStore,
    mappings: &IdMappings,
    rootfs: &Path,
    parent_manifest_digest: Option<&Digest>,
    author: &str,
    comment: &str,
    update: Option<&ConfigUpdate>,
) -> Result<CommitOutcome> {
    let parent = match parent_manifest_digest {
        Some(digest) => {
            let manifest = read_manifest(blobs, digest)?;
            let config = read_config(blobs, &crate::from_oci_digest(manifest.config().digest())?)?;
            let tree = snapshots.get(digest)?.ok_or_else(|| {
                Error::corrupt(format!("no snapshot recorded for manifest {digest}"))
            })?;
            Some((manifest, config, tree))
        }
        None => None,
    };

    let container = snapshot(rootfs, mappings).ctx("snapshot rootfs")?;
    let base = parent.as_ref().map(|(_, _, tree)| tree);
    let empty = FsSpec::new();
    let diff = base.unwrap_or(&empty).diff(&container).ctx("diff rootfs")?;
    if diff.is_empty() {
        return Err(Error::EmptyDiff);
    }

    // stream the diff through a tar into the blob store as a gzip layer
    let mut tarfile = tempfile::tempfile().ctx("create layer temp file")?;
    {
        let mut writer = TarWriter::new(&mut tarfile);
        diff.write(&mut writer).ctx("generate layer")?;
    }
    tarfile.seek(SeekFrom::Start(0)).ctx("rewind layer")?;
    let (layer_digest, layer_size, diff_id) =
        blobs.put_layer(&tarfile).ctx("store layer blob")?;
    debug!(layer = %layer_digest, %diff_id, "stored layer");

    let config = build_config(
        parent.as_ref().map(|(_, config, _)| config),
        &diff_id,
        author,
        comment,
        update,
    )?;
    let (config_digest, config_size) =
        blobs.put_json(&config).ctx("store image config")?;

    let mut layers = parent
        .as_ref()
        .map(|(manifest, _, _)| manifest.layers().clone())
        .unwrap_or_default();
    layers.push(
        DescriptorBuilder::default()
            .media_type(MediaType::ImageLayerGzip)
            .digest(crate::to_oci_digest(&layer_digest)?)
            .size(layer_size)
            .build()
            .map_err(oci_err)?,
    );
    let manifest = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(
            DescriptorBuilder::default()
                .media_type(MediaType::ImageConfig)
                .digest(crate::to_oci_digest(&config_digest)?)
                .size(config_size)
                .build()
                .map_err(oci_err)?,
        )
        .layers(layers)
        .build()
        .map_err(oci_err)?;
    let (manifest_digest, manifest_size) =
        blobs.put_json(&manifest).ctx("store image manifest")?;

    snapshots
        .put(&manifest_digest, &container)
        .ctx("store rootfs snapshot")?;

    Ok(CommitOutcome {
        manifest_digest,
        manifest_size,
        manifest,
        image_id: config_digest,
        config,
    })
}

fn build_config(
    parent: Option<&ImageConfiguration>,
    diff_id: &Digest,
    author: &str,
    comment: &str,
    update: Option<&ConfigUpdate>,
) -> Result<ImageConfiguration> {
    let mut diff_ids = parent
        .map(|c| c.rootfs().diff_ids().clone())
        .unwrap_or_default();
    diff_ids.push(diff_id.to_string());
    let rootfs = RootFsBuilder::default()
        .typ("layers".to_string())
        .diff_ids(diff_ids)
        .build()
        .map_err(oci_err)?;

    let mut history = parent.and_then(|c| c.history().clone()).unwrap_or_default();
    history.push(
        HistoryBuilder::default()
            .created(rfc3339_now())
            .author(author.to_string())
            .comment(comment.to_string())
            .empty_layer(false)
            .build()
            .map_err(oci_err)?,
    );

    let container_config = merge_config(parent.and_then(|c| c.config().as_ref()), update)?;

    ImageConfigurationBuilder::default()
        .created(rfc3339_now())
        .author(author.to_string())
        .architecture(Arch::default())
        .os(Os::default())
        .config(container_config)
        .rootfs(rootfs)
        .history(history)
        .build()
        .map_err(oci_err)
}

/// Merge staged config changes over the inherited container config.
fn merge_config(old: Option<&Config>, update: Option<&ConfigUpdate>) -> Result<Config> {
    let update = update.cloned().unwrap_or_default();

    let entrypoint = update
        .entrypoint
        .or_else(|| old.and_then(|c| c.entrypoint().clone()));
    let cmd = update.cmd.or_else(|| old.and_then(|c| c.cmd().clone()));

    let mut env = old.and_then(|c| c.env().clone()).unwrap_or_default();
    env.extend(update.env);

    let mut labels = old.and_then(|c| c.labels().clone()).unwrap_or_default();
    labels.extend(update.labels);

    let user = update.user.or_else(|| old.and_then(|c| c.user().clone()));
    let working_dir = update
        .working_dir
        .or_else(|| old.and_then(|c| c.working_dir().clone()));
    let stop_signal = update
        .stop_signal
        .or_else(|| old.and_then(|c| c.stop_signal().clone()));

    let mut exposed_ports = old
        .and_then(|c| c.exposed_ports().clone())
        .unwrap_or_default();
    exposed_ports.extend(update.exposed_ports);
    exposed_ports.sort();
    exposed_ports.dedup();

    let volumes = old.and_then(|c| c.volumes().clone());

    let mut builder = ConfigBuilder::default();
    if let Some(entrypoint) = entrypoint {
        builder = builder.entrypoint(entrypoint);
    }
    if let Some(cmd) = cmd {
        builder = builder.cmd(cmd);
    }
    if !env.is_empty() {
        builder = builder.env(env);
    }
    if !labels.is_empty() {
        builder = builder.labels(labels);
    }
    if let Some(user) = user {
        builder = builder.user(user);
    }
    if let Some(working_dir) = working_dir {
        builder = builder.working_dir(working_dir);
    }
    if let Some(stop_signal) = stop_signal {
        builder = builder.stop_signal(stop_signal);
    }
    if !exposed_ports.is_empty() {
        builder = builder.exposed_ports(exposed_ports);
    }
    if let Some(volumes) = volumes {
        builder = builder.volumes(volumes);
    }
    builder.build().map_err(oci_err)
}

/// The current time in the RFC 3339 form OCI documents use.
pub(crate) fn rfc3339_now() -> String {
    rfc3339(SystemTime::now())
}

fn rfc3339(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        rem / 3600,
        (rem / 60) % 60,
        rem % 60
    )
}

// days-to-civil conversion for the proleptic Gregorian calendar
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339() {
        assert_eq!(rfc3339(UNIX_EPOCH), "1970-01-01T00:00:00Z");
        let t = UNIX_EPOCH + std::time::Duration::from_secs(951_827_696);
        assert_eq!(rfc3339(t), "2000-02-29T11:14:56Z");
        let t = UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        assert_eq!(rfc3339(t), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_merge_config() {
        let old = ConfigBuilder::default()
            .env(vec!["PATH=/bin".to_string()])
            .cmd(vec!["sh".to_string()])
            .build()
            .unwrap();

        let update = ConfigUpdate {
            entrypoint: Some(vec!["/entry".to_string()]),
            env: vec!["MODE=prod".to_string()],
            ..ConfigUpdate::default()
        };

        let merged = merge_config(Some(&old), Some(&update)).unwrap();
        assert_eq!(
            merged.entrypoint().as_ref().unwrap(),
            &vec!["/entry".to_string()]
        );
        assert_eq!(merged.cmd().as_ref().unwrap(), &vec!["sh".to_string()]);
        assert_eq!(
            merged.env().as_ref().unwrap(),
            &vec!["PATH=/bin".to_string(), "MODE=prod".to_string()]
        );
    }

    #[test]
    fn test_config_update_is_empty() {
        assert!(ConfigUpdate::default().is_empty());
        let update = ConfigUpdate {
            user: Some("web".to_string()),
            ..ConfigUpdate::default()
        };
        assert!(!update.is_empty());
    }
}
