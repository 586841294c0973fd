//! Kubernetes objects to Terraform state

use std::collections::BTreeMap;

use harvester_common::api::{find_condition, Condition};
use harvester_common::build_id;
use harvester_common::constants::{
    ANNOTATION_DESCRIPTION, LABEL_TAG_PREFIX, STATE_ACTIVE, STATE_FAILED, STATE_IN_PROGRESS,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::state::{string_value, Value};

/// State of one resource being read back from the cluster
#[derive(Debug, Clone)]
pub struct Importer {
    pub id: String,
    pub name: String,
    pub resource_type: &'static str,
    pub states: BTreeMap<String, Value>,
}

impl Importer {
    pub fn new(resource_type: &'static str, namespace: &str, name: &str) -> Self {
        let id = build_id(namespace, name);
        let mut states = BTreeMap::new();
        states.insert("id".to_string(), string_value(&id));
        states.insert("name".to_string(), string_value(name));
        if !namespace.is_empty() {
            states.insert("namespace".to_string(), string_value(namespace));
        }
        Self {
            id,
            name: name.to_string(),
            resource_type,
            states,
        }
    }

    /// Start from object metadata: identity, description and tags.
    pub fn from_meta(resource_type: &'static str, meta: &ObjectMeta) -> Self {
        let mut importer = Self::new(
            resource_type,
            meta.namespace.as_deref().unwrap_or_default(),
            meta.name.as_deref().unwrap_or_default(),
        );
        importer
            .set("description", string_value(description(meta)))
            .set("tags", tags(meta));
        importer
    }

    pub fn set(&mut self, key: &str, value: Value) -> &mut Self {
        self.states.insert(key.to_string(), value);
        self
    }

    pub fn set_state(&mut self, state: &str, message: &str) -> &mut Self {
        self.set("state", string_value(state))
            .set("message", string_value(message))
    }

    pub fn into_state(self) -> Value {
        Value::Map(self.states)
    }
}

/// Description annotation, empty when unset
pub fn description(meta: &ObjectMeta) -> String {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_DESCRIPTION))
        .cloned()
        .unwrap_or_default()
}

/// Tag labels with their prefix stripped
pub fn tags(meta: &ObjectMeta) -> Value {
    let tags: BTreeMap<String, Value> = meta
        .labels
        .iter()
        .flatten()
        .filter_map(|(k, v)| {
            k.strip_prefix(LABEL_TAG_PREFIX)
                .map(|key| (key.to_string(), string_value(v)))
        })
        .collect();
    if tags.is_empty() {
        Value::Null
    } else {
        Value::Map(tags)
    }
}

/// `state`/`message` from a readiness-style condition: true is Active,
/// false is Failed, missing is In-Progress.
pub fn state_from_condition(conditions: &[Condition], type_: &str) -> (String, String) {
    match find_condition(conditions, type_) {
        Some(c) if c.is_true() => (STATE_ACTIVE.to_string(), c.message().to_string()),
        Some(c) if c.is_false() => (STATE_FAILED.to_string(), c.message().to_string()),
        Some(c) => (STATE_IN_PROGRESS.to_string(), c.message().to_string()),
        None => (STATE_IN_PROGRESS.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_meta() {
        let meta = ObjectMeta {
            name: Some("ubuntu".into()),
            namespace: Some("default".into()),
            labels: Some(BTreeMap::from([
                ("tag.harvesterhci.io/os".to_string(), "linux".to_string()),
                ("other".to_string(), "skip".to_string()),
            ])),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_DESCRIPTION.to_string(),
                "base image".to_string(),
            )])),
            ..Default::default()
        };
        let state = Importer::from_meta("harvester_image", &meta).into_state();
        assert_eq!(state.get("id"), Some(&string_value("default/ubuntu")));
        assert_eq!(state.get("description"), Some(&string_value("base image")));
        let tags = state.get("tags").unwrap().as_map().unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.get("os"), Some(&string_value("linux")));
    }

    #[test]
    fn test_cluster_scoped_id() {
        let importer = Importer::new("harvester_setting", "", "ntp-servers");
        assert_eq!(importer.id, "ntp-servers");
        assert!(importer.states.get("namespace").is_none());
    }

    #[test]
    fn test_state_from_condition() {
        let conditions = vec![Condition {
            type_: "Imported".into(),
            status: "False".into(),
            message: Some("download failed".into()),
            ..Default::default()
        }];
        assert_eq!(
            state_from_condition(&conditions, "Imported"),
            ("Failed".to_string(), "download failed".to_string())
        );
        assert_eq!(state_from_condition(&[], "Imported").0, "In-Progress");
    }
}
