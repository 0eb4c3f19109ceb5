//! Stamps ownership onto rendered chart manifests.
//!
//! Helm hands the full multi-document manifest stream to a post-renderer on stdin and applies
//! whatever comes back on stdout. Each object gets linked to the owning IstioRevision: namespaced
//! objects in the owner's namespace get a controller owner reference (so the platform garbage
//! collects them), everything else gets the ownership annotations.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::ownership::{is_cluster_scoped, AnnotatedOwner};
use crate::Result;

pub struct OwnerStamp {
    pub reference: OwnerReference,
    pub namespace: String,
}

impl OwnerStamp {
    fn annotated_owner(&self) -> AnnotatedOwner {
        AnnotatedOwner::from_owner_reference(&self.reference, Some(&self.namespace))
    }

    fn stamp(&self, object: &mut Map<String, Value>) -> Result<()> {
        let kind = object
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let metadata = object
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(metadata) = metadata else {
            return Ok(());
        };

        // owner references may not cross namespaces
        let foreign_namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .is_some_and(|ns| ns != self.namespace);

        if is_cluster_scoped(&kind) || foreign_namespace {
            let annotations = object_field(metadata, "annotations");
            for (key, value) in self.annotated_owner().annotations() {
                annotations.insert(key, Value::String(value));
            }
        } else {
            let reference = serde_json::to_value(&self.reference)?;
            let Value::Array(references) = metadata
                .entry("ownerReferences")
                .or_insert_with(|| Value::Array(Vec::new()))
            else {
                return Ok(());
            };
            references.retain(|r| {
                r.get("uid").and_then(Value::as_str) != Some(self.reference.uid.as_str())
            });
            references.push(reference);
        }
        Ok(())
    }
}

fn object_field<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let entry = map
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(map) => map,
        _ => unreachable!("replaced with an object above"),
    }
}

/// Stamp every object in a multi-document YAML stream. Empty documents are dropped.
pub fn stamp_manifests(input: &str, owner: &OwnerStamp) -> Result<String> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(input) {
        let mut value = Value::deserialize(document)?;
        match &mut value {
            Value::Null => continue,
            Value::Object(object) => {
                // helm hooks and lists are passed through with their items stamped
                if let Some(Value::Array(items)) = object.get_mut("items") {
                    for item in items.iter_mut() {
                        if let Value::Object(item) = item {
                            owner.stamp(item)?;
                        }
                    }
                } else {
                    owner.stamp(object)?;
                }
            }
            _ => {}
        }
        documents.push(serde_yaml::to_string(&value)?);
    }
    Ok(documents
        .iter()
        .map(|d| format!("---\n{d}"))
        .collect::<String>())
}
