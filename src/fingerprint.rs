//! Configuration fingerprints driving update decisions
//!
//! Every object gantry builds is stamped with a fingerprint annotation: the
//! canonical JSON form of the object with cluster-assigned metadata and the
//! annotation itself excluded. Reconciliation compares the stamped value on
//! the live object against the freshly built one; the comparison is the only
//! update trigger.
//!
//! The fingerprint is the full serialized form, not a hash. Hashes tie the
//! stored value to a hasher implementation that has to stay stable across
//! releases; the serialized form only has to survive serde_json's canonical
//! map ordering, which is sorted by key.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::Serialize;

use crate::FINGERPRINT_ANNOTATION;

/// Remove metadata the cluster assigns after admission.
///
/// Live objects carry these; built objects never do. Both sides go through
/// here so the comparison sees neither.
pub fn strip_cluster_metadata(meta: &mut ObjectMeta) {
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    meta.generation = None;
}

/// Compute the fingerprint of an object.
///
/// The object is reduced (cluster metadata stripped, the fingerprint
/// annotation removed, `status` dropped) and serialized to canonical JSON.
pub fn fingerprint<K>(obj: &K) -> crate::Result<String>
where
    K: Resource + Serialize + Clone,
{
    let mut reduced = obj.clone();
    strip_cluster_metadata(reduced.meta_mut());

    let annotations = &mut reduced.meta_mut().annotations;
    if let Some(map) = annotations {
        map.remove(FINGERPRINT_ANNOTATION);
        if map.is_empty() {
            *annotations = None;
        }
    }

    let mut value = serde_json::to_value(&reduced)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
    }
    Ok(value.to_string())
}

/// Stamp an object with its own fingerprint and return the value.
///
/// Stamping is stable: the annotation is excluded from the computation, so
/// stamping twice writes the same value.
pub fn stamp<K>(obj: &mut K) -> crate::Result<String>
where
    K: Resource + Serialize + Clone,
{
    let value = fingerprint(obj)?;
    obj.annotations_mut()
        .insert(FINGERPRINT_ANNOTATION.to_string(), value.clone());
    Ok(value)
}

/// Read the fingerprint recorded on a live object.
///
/// Falls back to reducing and serializing the live object when the
/// annotation is absent. A live object was admitted and defaulted by the
/// API server, so the fallback value practically never matches a built
/// fingerprint; objects from before fingerprinting therefore take exactly
/// one update and converge.
pub fn read_fingerprint<K>(live: &K) -> crate::Result<String>
where
    K: Resource + Serialize + Clone,
{
    if let Some(value) = live.annotations().get(FINGERPRINT_ANNOTATION) {
        return Ok(value.clone());
    }
    fingerprint(live)
}
