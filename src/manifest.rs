//! Media types and helpers for OCI / Docker v2 manifest documents.
//!
//! Manifests are carried as raw [`serde_json::Value`] documents so that the
//! registry response can be cached and surfaced unchanged; only the fields
//! needed for platform resolution and identity comparison are inspected.

use serde_json::Value;

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Accept header covering manifest lists and single manifests, both schemas.
pub fn list_accept_header() -> String {
    [
        MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_OCI_MANIFEST,
        MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        MEDIA_TYPE_DOCKER_MANIFEST,
    ]
    .join(",")
}

/// Accept header for a single-platform manifest fetched by digest.
pub fn manifest_accept_header() -> String {
    [MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST].join(",")
}

/// Whether the document is a multi-architecture manifest list / image index.
pub fn is_manifest_list(manifest: &Value) -> bool {
    let media_type = manifest
        .get("mediaType")
        .and_then(Value::as_str)
        .unwrap_or_default();
    (media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST || media_type == MEDIA_TYPE_OCI_INDEX)
        && manifest.get("manifests").is_some()
}

/// Digest of the manifest-list entry matching (architecture, os) exactly.
/// Entries without a digest are skipped.
pub fn platform_digest<'a>(manifest_list: &'a Value, arch: &str, os: &str) -> Option<&'a str> {
    let entries = manifest_list.get("manifests")?.as_array()?;
    for entry in entries {
        let platform = entry.get("platform");
        let entry_arch = platform
            .and_then(|p| p.get("architecture"))
            .and_then(Value::as_str);
        let entry_os = platform.and_then(|p| p.get("os")).and_then(Value::as_str);
        if entry_arch == Some(arch) && entry_os == Some(os) {
            if let Some(digest) = entry.get("digest").and_then(Value::as_str) {
                return Some(digest);
            }
        }
    }
    None
}

/// Surface the config digest of a schema-2 manifest under "Id".
///
/// The config digest is the content identity compared against a container's
/// ImageID; manifests of other schemas are left untouched and end up without
/// a comparable identity.
pub fn annotate_image_id(manifest: &mut Value) {
    if manifest.get("schemaVersion").and_then(Value::as_u64) != Some(2) {
        return;
    }
    let media_type = manifest
        .get("mediaType")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if media_type != MEDIA_TYPE_DOCKER_MANIFEST && media_type != MEDIA_TYPE_OCI_MANIFEST {
        return;
    }
    let Some(digest) = manifest
        .pointer("/config/digest")
        .and_then(Value::as_str)
        .map(str::to_owned)
    else {
        return;
    };
    if let Some(object) = manifest.as_object_mut() {
        object.insert("Id".to_string(), Value::String(digest));
    }
}

/// Docker reports "x86_64" for amd64 hosts, registries speak "amd64".
pub fn normalize_arch(arch: &str) -> &str {
    if arch == "x86_64" { "amd64" } else { arch }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_list() -> Value {
        json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_DOCKER_MANIFEST_LIST,
            "manifests": [
                {
                    "digest": "sha256:amd64digest",
                    "platform": {"architecture": "amd64", "os": "linux"}
                },
                {
                    "digest": "sha256:arm64digest",
                    "platform": {"architecture": "arm64", "os": "linux"}
                }
            ]
        })
    }

    #[test]
    fn test_detects_manifest_list() {
        assert!(is_manifest_list(&sample_list()));
        let single = json!({"schemaVersion": 2, "mediaType": MEDIA_TYPE_DOCKER_MANIFEST});
        assert!(!is_manifest_list(&single));
    }

    #[test]
    fn test_platform_digest_exact_match() {
        let list = sample_list();
        assert_eq!(
            platform_digest(&list, "arm64", "linux"),
            Some("sha256:arm64digest")
        );
        assert_eq!(platform_digest(&list, "s390x", "linux"), None);
        assert_eq!(platform_digest(&list, "amd64", "windows"), None);
    }

    #[test]
    fn test_platform_digest_skips_entries_without_digest() {
        let list = json!({
            "mediaType": MEDIA_TYPE_OCI_INDEX,
            "manifests": [
                {"platform": {"architecture": "amd64", "os": "linux"}},
                {"digest": "sha256:good", "platform": {"architecture": "amd64", "os": "linux"}}
            ]
        });
        assert_eq!(platform_digest(&list, "amd64", "linux"), Some("sha256:good"));
    }

    #[test]
    fn test_annotate_image_id() {
        let mut manifest = json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_DOCKER_MANIFEST,
            "config": {"digest": "sha256:cafe"}
        });
        annotate_image_id(&mut manifest);
        assert_eq!(manifest["Id"], "sha256:cafe");
    }

    #[test]
    fn test_annotate_ignores_other_schemas() {
        let mut v1 = json!({
            "schemaVersion": 1,
            "mediaType": MEDIA_TYPE_DOCKER_MANIFEST,
            "config": {"digest": "sha256:cafe"}
        });
        annotate_image_id(&mut v1);
        assert!(v1.get("Id").is_none());

        let mut list = sample_list();
        annotate_image_id(&mut list);
        assert!(list.get("Id").is_none());
    }

    #[test]
    fn test_normalize_arch() {
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("amd64"), "amd64");
        assert_eq!(normalize_arch("arm64"), "arm64");
    }
}
