//! OCI image store, bundle store and image builder on top of the `vessel`
//! storage core.
//!
//! This crate owns everything that speaks OCI types: the per-name image
//! repository index, the image-id side index, the aggregate image store with
//! its commit and GC paths, the bundle store that materializes images into
//! runnable rootfs bundles, the high-level image builder, and the host-path
//! source collector.

pub mod bundle;
pub mod builder;
pub mod collect;
pub mod imageid;
pub mod import;
pub mod repo;
pub mod store;
pub mod unpack;

mod commit;

pub use vessel::{Digest, Error, ErrorKind, Result};

pub use bundle::{Bundle, BundleStore, ContainerStore, LockedBundle, NoContainers};
pub use builder::ImageBuilder;
pub use commit::ConfigUpdate;
pub use collect::SourceCollector;
pub use import::TrustPolicy;
pub use store::{Image, ImageStore, ImageStoreRW};

/// Annotation carrying the tag of an index entry.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Annotation marking a manifest that entered the store through an import.
pub const IMPORTED_ANNOTATION: &str = "com.github.vessel-engine.imported";

/// Annotation carrying a bundle's id inside its runtime config.
pub const BUNDLE_ID_ANNOTATION: &str = "com.github.vessel-engine.bundle.id";

/// Convert a core digest into the OCI type.
pub(crate) fn to_oci_digest(digest: &Digest) -> Result<oci_spec::image::Digest> {
    digest
        .to_string()
        .parse()
        .map_err(|e| Error::invalid_input(format!("digest {digest}: {e:?}")))
}

/// Convert an OCI digest into the core type, re-validating it.
pub(crate) fn from_oci_digest(digest: &oci_spec::image::Digest) -> Result<Digest> {
    Digest::parse(&digest.to_string())
}

/// Map an `oci-spec` parse/build error onto the store error model.
pub(crate) fn oci_err(e: oci_spec::OciSpecError) -> Error {
    Error::corrupt(format!("OCI document: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_conversion() {
        let digest = Digest::sha256_of(b"x");
        let oci = to_oci_digest(&digest).unwrap();
        assert_eq!(from_oci_digest(&oci).unwrap(), digest);
    }
}
