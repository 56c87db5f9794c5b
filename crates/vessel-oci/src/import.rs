//! Importing images via an external transport copier.
//!
//! Transport negotiation (registries, auth, compression variants) is not
//! implemented here: the copy is delegated to `skopeo copy`, pointed at a
//! temporary OCI layout whose `blobs` directory is a symlink into the shared
//! blob store — the copier populates the store directly and only the
//! temporary `index.json` needs merging afterwards. The copy is gated by the
//! store's signature trust policy.

use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use vessel::error::{Context, Error, Result};
use vessel::util::generate_tmpname;

use crate::repo::ImageRepo;
use crate::store::{split_name_ref, Image, ImageStoreRW};
use crate::IMPORTED_ANNOTATION;

/// Signature policy applied to imported images.
#[derive(Debug, Clone, Default)]
pub enum TrustPolicy {
    /// The system default policy (`/etc/containers/policy.json`).
    #[default]
    Default,
    /// An explicit policy file.
    PolicyFile(PathBuf),
    /// Accept anything. For tests and air-gapped setups only.
    Insecure,
}

/// Derive the store-local `(name, ref)` an imported image is tagged under.
fn name_from_transport(transport_ref: &str) -> Result<(String, String)> {
    let (_, rest) = transport_ref
        .split_once(':')
        .ok_or_else(|| Error::invalid_input(format!("{transport_ref:?} has no transport prefix")))?;
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        return Err(Error::invalid_input(format!(
            "{transport_ref:?} has no image reference"
        )));
    }
    // a digest reference pins the content; tag it under "latest"
    match rest.split_once('@') {
        Some((name, _digest)) => Ok((name.to_string(), "latest".to_string())),
        None => split_name_ref(rest),
    }
}

pub(crate) fn import(rw: &ImageStoreRW<'_>, transport_ref: &str) -> Result<Vec<Image>> {
    let store = rw.store();
    let (name, reference) = name_from_transport(transport_ref)?;

    let tmp = store.dir().join(generate_tmpname(".import-"));
    let result = import_into(rw, transport_ref, &name, &reference, &tmp);
    let _ = std::fs::remove_dir_all(&tmp);
    result.with_ctx(|| format!("import {transport_ref}"))
}

fn import_into(
    rw: &ImageStoreRW<'_>,
    transport_ref: &str,
    name: &str,
    reference: &str,
    tmp: &std::path::Path,
) -> Result<Vec<Image>> {
    let store = rw.store();
    std::fs::create_dir(tmp).with_ctx(|| format!("create {}", tmp.display()))?;
    // the copier writes blobs straight into the shared store
    std::os::unix::fs::symlink(store.blobs().root(), tmp.join("blobs"))
        .ctx("symlink shared blob directory")?;

    let mut command = Command::new("skopeo");
    match store.trust() {
        TrustPolicy::Default => {}
        TrustPolicy::PolicyFile(path) => {
            command.arg("--policy").arg(path);
        }
        TrustPolicy::Insecure => {
            command.arg("--insecure-policy");
        }
    }
    command
        .arg("copy")
        .arg(transport_ref)
        .arg(format!("oci:{}:{}", tmp.display(), reference));

    debug!(?command, "running transport copier");
    let output = command.output().ctx("run skopeo")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.contains("rejected") || stderr.contains("policy") {
            return Err(Error::Trust(stderr.to_string()));
        }
        return Err(Error::corrupt(format!("transport copy failed: {stderr}")));
    }

    // merge the temporary index into the store's repository for the name
    let index_data = std::fs::read(tmp.join("index.json")).ctx("read imported index")?;
    let index: oci_spec::image::ImageIndex = serde_json::from_slice(&index_data)
        .map_err(|e| Error::corrupt(format!("imported index.json: {e}")))?;

    let mut images = Vec::new();
    for descriptor in index.manifests() {
        let manifest_digest = crate::from_oci_digest(descriptor.digest())?;
        let entry_ref = ImageRepo::ref_of(descriptor).unwrap_or(reference);

        let manifest = crate::store::read_manifest(store.blobs(), &manifest_digest)?;
        let image_id = crate::from_oci_digest(manifest.config().digest())?;
        let config = crate::store::read_config(store.blobs(), &image_id)?;
        store.image_ids().add(&image_id, &manifest_digest)?;

        rw.tag_manifest(
            &manifest_digest,
            descriptor.size(),
            name,
            entry_ref,
            &[(IMPORTED_ANNOTATION, "true")],
        )?;
        images.push(Image {
            name: Some(name.to_string()),
            reference: Some(entry_ref.to_string()),
            id: image_id,
            manifest_digest,
            manifest,
            config,
            last_used: std::time::SystemTime::now(),
        });
    }
    if images.is_empty() {
        return Err(Error::corrupt("transport copy produced no manifests"));
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_transport() {
        assert_eq!(
            name_from_transport("docker://alpine:3.18").unwrap(),
            ("alpine".to_string(), "3.18".to_string())
        );
        assert_eq!(
            name_from_transport("docker://registry.example.com/team/app").unwrap(),
            ("registry.example.com/team/app".to_string(), "latest".to_string())
        );
        assert_eq!(
            name_from_transport("oci:/tmp/layout:v1").unwrap(),
            ("/tmp/layout".to_string(), "v1".to_string())
        );
        let (name, reference) = name_from_transport(
            "docker://alpine@sha256:0000000000000000000000000000000000000000000000000000000000000000",
        )
        .unwrap();
        assert_eq!(name, "alpine");
        assert_eq!(reference, "latest");

        assert!(name_from_transport("no-transport").is_err());
        assert!(name_from_transport("docker://").is_err());
    }
}
