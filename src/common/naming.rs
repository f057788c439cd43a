//! NAC UUID minting and the labels/annotations stamped on engine objects.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::constants::{
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, NAC_MANAGED_LABEL, ORIGIN_NAMESPACE_ANNOTATION,
    ORIGIN_NAME_ANNOTATION, ORIGIN_UID_ANNOTATION,
};

const LABEL_VALUE_MAX_LEN: usize = 63;

/// Mints the NAC UUID for a freshly observed tenant object. The value
/// doubles as the engine object name and the binding label value, so it must
/// satisfy both grammars; a random v4 UUID does. Persisted to status exactly
/// once and never regenerated.
pub fn generate_nac_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Labels identifying an engine object as non-admin managed.
pub fn non_admin_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (NAC_MANAGED_LABEL.to_string(), "true".to_string()),
    ])
}

/// Annotations recording which tenant object an engine object belongs to.
/// Cross-namespace owner references are not allowed by the API server; this
/// trio plus the UUID label is the binding instead.
pub fn origin_annotations(meta: &ObjectMeta) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            ORIGIN_NAMESPACE_ANNOTATION.to_string(),
            meta.namespace.clone().unwrap_or_default(),
        ),
        (
            ORIGIN_NAME_ANNOTATION.to_string(),
            meta.name.clone().unwrap_or_default(),
        ),
        (
            ORIGIN_UID_ANNOTATION.to_string(),
            meta.uid.clone().unwrap_or_default(),
        ),
    ])
}

/// Looks up `key` in a label map and returns the value only when it is a
/// well-formed, non-empty label value. Used for the sync label, whose value
/// becomes the adopted NAC UUID.
pub fn valid_label_value_from<'a>(
    labels: Option<&'a BTreeMap<String, String>>,
    key: &str,
) -> Option<&'a str> {
    let value = labels?.get(key)?.as_str();
    if value.is_empty() || value.len() > LABEL_VALUE_MAX_LEN {
        return None;
    }
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    let valid_ends = value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value.ends_with(|c: char| c.is_ascii_alphanumeric());
    (valid_chars && valid_ends).then_some(value)
}

/// Sanitizes an arbitrary object name into the label value grammar. Names up
/// to 63 characters pass through unchanged; longer ones are truncated and
/// suffixed with a digest of the full name so distinct names stay distinct.
pub fn valid_label_value(name: &str) -> String {
    if name.len() <= LABEL_VALUE_MAX_LEN {
        return name.to_string();
    }
    let digest = Sha256::digest(name.as_bytes());
    let suffix = format!("{:x}", digest);
    format!("{}{}", &name[..LABEL_VALUE_MAX_LEN - 6], &suffix[..6])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::constants::NAB_SYNC_LABEL;

    #[test]
    fn nac_uuid_is_a_valid_name_and_label_value() {
        let uuid = generate_nac_uuid();
        assert_eq!(uuid.len(), 36);
        assert_eq!(valid_label_value(&uuid), uuid);
        assert_ne!(uuid, generate_nac_uuid());
    }

    #[test]
    fn labels_carry_marker_and_manager() {
        let labels = non_admin_labels();
        assert_eq!(labels.get(NAC_MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(
            labels.get(MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );
    }

    #[test]
    fn origin_annotations_record_the_tenant() {
        let meta = ObjectMeta {
            namespace: Some("team-a".to_string()),
            name: Some("db".to_string()),
            uid: Some("1234".to_string()),
            ..Default::default()
        };
        let annotations = origin_annotations(&meta);
        assert_eq!(
            annotations.get(ORIGIN_NAMESPACE_ANNOTATION).map(String::as_str),
            Some("team-a")
        );
        assert_eq!(
            annotations.get(ORIGIN_NAME_ANNOTATION).map(String::as_str),
            Some("db")
        );
        assert_eq!(
            annotations.get(ORIGIN_UID_ANNOTATION).map(String::as_str),
            Some("1234")
        );
    }

    #[test]
    fn sync_label_must_be_well_formed() {
        let labels = |v: &str| BTreeMap::from([(NAB_SYNC_LABEL.to_string(), v.to_string())]);

        let valid = labels("0495ba35-4b9e-47b2-9896-0f91ae125cd8");
        assert_eq!(
            valid_label_value_from(Some(&valid), NAB_SYNC_LABEL),
            Some("0495ba35-4b9e-47b2-9896-0f91ae125cd8")
        );

        let too_long = "x".repeat(64);
        for bad in ["", "-leading-dash", "trailing-dash-", "has spaces", too_long.as_str()] {
            let m = labels(bad);
            assert_eq!(valid_label_value_from(Some(&m), NAB_SYNC_LABEL), None, "{bad:?}");
        }
        assert_eq!(valid_label_value_from(None, NAB_SYNC_LABEL), None);
    }

    #[test]
    fn long_names_are_truncated_with_digest() {
        let long = "a".repeat(100);
        let sanitized = valid_label_value(&long);
        assert_eq!(sanitized.len(), 63);
        assert!(sanitized.starts_with(&"a".repeat(57)));
        // distinct long names must not collide after truncation
        let other = format!("{}b", "a".repeat(99));
        assert_ne!(sanitized, valid_label_value(&other));
    }
}
