use latchflow_core::{BundleId, BundleObject, FileRecord};
use latchflow_crypto::sha256_hex;

/// Canonicalization version prefix; bump on any layout change.
const DIGEST_VERSION: &str = "lf-bundle-v1";

/// Deterministic digest over a bundle's logical contents.
///
/// Hashes the canonical serialization
/// `version\0 bundle_id\0 count\0 (file_id\0 sort_order\0 content_hash\0)*`
/// over the enabled objects in `(sort_order, id)` order -- the same order
/// the archive is materialized in. The digest depends only on which file
/// contents appear where, never on archive bytes, so it decides whether a
/// rebuild is required.
#[must_use]
pub fn compute_bundle_digest(
    bundle_id: &BundleId,
    objects: &[(BundleObject, FileRecord)],
) -> String {
    let mut canonical = Vec::new();
    canonical.extend_from_slice(DIGEST_VERSION.as_bytes());
    canonical.push(0);
    canonical.extend_from_slice(bundle_id.as_str().as_bytes());
    canonical.push(0);
    canonical.extend_from_slice(objects.len().to_string().as_bytes());
    canonical.push(0);
    for (object, file) in objects {
        canonical.extend_from_slice(file.id.as_str().as_bytes());
        canonical.push(0);
        canonical.extend_from_slice(object.sort_order.to_string().as_bytes());
        canonical.push(0);
        canonical.extend_from_slice(file.content_hash.as_bytes());
        canonical.push(0);
    }
    sha256_hex(&canonical)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use latchflow_core::FileId;

    use super::*;

    fn object(id: &str, file: &str, sort: i32) -> (BundleObject, FileRecord) {
        (
            BundleObject {
                id: id.to_owned(),
                bundle_id: BundleId::new("b-1"),
                file_id: FileId::new(file),
                sort_order: sort,
                required: true,
                is_enabled: true,
            },
            FileRecord {
                id: FileId::new(file),
                key: format!("files/{file}"),
                storage_key: format!("objects/sha256/aa/bb/{file}"),
                size: 1,
                content_type: "text/plain".into(),
                content_hash: sha256_hex(file.as_bytes()),
                etag: None,
                metadata: Default::default(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        )
    }

    #[test]
    fn digest_is_stable_for_fixed_inputs() {
        let objects = vec![object("o-1", "f-1", 1), object("o-2", "f-2", 2)];
        let a = compute_bundle_digest(&BundleId::new("b-1"), &objects);
        let b = compute_bundle_digest(&BundleId::new("b-1"), &objects);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn swapping_sort_orders_changes_the_digest() {
        let forward = vec![object("o-1", "f-1", 1), object("o-2", "f-2", 2)];
        let mut swapped = vec![object("o-1", "f-1", 2), object("o-2", "f-2", 1)];
        // Re-sort the way the store would return them.
        swapped.sort_by_key(|(o, _)| (o.sort_order, o.id.clone()));

        assert_ne!(
            compute_bundle_digest(&BundleId::new("b-1"), &forward),
            compute_bundle_digest(&BundleId::new("b-1"), &swapped),
        );
    }

    #[test]
    fn digest_depends_on_bundle_identity_and_membership() {
        let objects = vec![object("o-1", "f-1", 1)];
        let one = compute_bundle_digest(&BundleId::new("b-1"), &objects);
        let other_bundle = compute_bundle_digest(&BundleId::new("b-2"), &objects);
        assert_ne!(one, other_bundle);

        let fewer = compute_bundle_digest(&BundleId::new("b-1"), &[]);
        assert_ne!(one, fewer);
    }

    #[test]
    fn digest_changes_with_file_content() {
        let mut objects = vec![object("o-1", "f-1", 1)];
        let before = compute_bundle_digest(&BundleId::new("b-1"), &objects);
        objects[0].1.content_hash = sha256_hex(b"different bytes");
        let after = compute_bundle_digest(&BundleId::new("b-1"), &objects);
        assert_ne!(before, after);
    }
}
