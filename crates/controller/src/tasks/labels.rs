//! Shared labels, owner references and selectors for owned sub-resources

use crate::tasks::cluster::OwnerKey;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;

/// Marks every object the controller manages
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "kindling";
/// Name of the owning descriptor
pub const LABEL_OWNER: &str = "apps.example.com/owner";
/// Kind of the owning descriptor
pub const LABEL_OWNER_KIND: &str = "apps.example.com/owner-kind";
/// Role of the object within its owner (app, dependency, runner)
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
/// Pod selector label; value is the workload name
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// Dependency type for dependency stacks
pub const LABEL_DEPENDENCY_TYPE: &str = "apps.example.com/dependency-type";

/// Labels carried by every object owned by `owner`
#[must_use]
pub fn owned_labels(owner: &OwnerKey, component: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(LABEL_OWNER.to_string(), sanitize_label_value(&owner.name));
    labels.insert(
        LABEL_OWNER_KIND.to_string(),
        sanitize_label_value(owner.kind.kind()),
    );
    labels.insert(LABEL_COMPONENT.to_string(), component.to_string());
    labels
}

/// Labels identifying the pods of one workload
#[must_use]
pub fn selector_labels(workload: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_INSTANCE.to_string(), workload.to_string());
    labels
}

/// Selector matching everything `owner` manages
#[must_use]
pub fn owner_selector(owner: &OwnerKey) -> String {
    format!(
        "{LABEL_MANAGED_BY}={MANAGED_BY_VALUE},{LABEL_OWNER}={},{LABEL_OWNER_KIND}={}",
        sanitize_label_value(&owner.name),
        sanitize_label_value(owner.kind.kind())
    )
}

/// Controller owner reference pointing back at the descriptor
#[must_use]
pub fn owner_reference(owner: &OwnerKey) -> OwnerReference {
    OwnerReference {
        api_version: owner.kind.api_version().to_string(),
        kind: owner.kind.kind().to_string(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Metadata for a sub-resource: name, owner labels and back-reference
#[must_use]
pub fn owned_meta(owner: &OwnerKey, name: &str, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(owner.namespace.clone()),
        labels: Some(owned_labels(owner, component)),
        owner_references: Some(vec![owner_reference(owner)]),
        ..Default::default()
    }
}

/// Clamp an arbitrary string into a valid label value
#[must_use]
pub fn sanitize_label_value(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let mut sanitized = input.replace(' ', "-");
    sanitized.retain(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

    // Truncate to 63 characters (Kubernetes label limit)
    if sanitized.len() > 63 {
        sanitized.truncate(63);
    }

    sanitized
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::cluster::OwnerKind;

    fn owner() -> OwnerKey {
        OwnerKey {
            kind: OwnerKind::Environment,
            namespace: "dev".to_string(),
            name: "shop".to_string(),
            uid: "uid-1".to_string(),
        }
    }

    #[test]
    fn owner_reference_blocks_deletion() {
        let r = owner_reference(&owner());
        assert_eq!(r.kind, "DevStagingEnvironment");
        assert_eq!(r.api_version, "apps.example.com/v1alpha1");
        assert_eq!(r.controller, Some(true));
        assert_eq!(r.block_owner_deletion, Some(true));
    }

    #[test]
    fn selector_matches_labels() {
        let labels = owned_labels(&owner(), "app");
        let selector = owner_selector(&owner());
        for clause in selector.split(',') {
            let (k, v) = clause.split_once('=').unwrap();
            assert_eq!(labels.get(k).map(String::as_str), Some(v));
        }
    }

    #[test]
    fn sanitize_strips_invalid_characters() {
        assert_eq!(sanitize_label_value("-my app!-"), "my-app");
        assert_eq!(sanitize_label_value(&"x".repeat(80)).len(), 63);
    }
}
