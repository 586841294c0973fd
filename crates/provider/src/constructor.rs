//! Terraform attributes to Kubernetes objects
//!
//! A constructor is an ordered list of processors. Each names an attribute,
//! how to apply its value to the target object, and whether the attribute is
//! required. Optional attributes follow GetOk semantics: null, unknown and
//! zero values are skipped.

use std::collections::BTreeMap;

use harvester_common::constants::{ANNOTATION_DESCRIPTION, DEFAULT_NAMESPACE, LABEL_TAG_PREFIX};
use harvester_common::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use crate::state::{get_ok, get_string_map_attr, Value};

type ParseFn<'a, T> = Box<dyn Fn(&mut T, &Value) -> Result<()> + Send + Sync + 'a>;

pub struct Processor<'a, T> {
    pub field: &'static str,
    parse: ParseFn<'a, T>,
    pub required: bool,
    /// Call `parse` once per list element instead of once with the list
    pub each: bool,
}

impl<'a, T> Processor<'a, T> {
    pub fn new(
        field: &'static str,
        parse: impl Fn(&mut T, &Value) -> Result<()> + Send + Sync + 'a,
    ) -> Self {
        Self {
            field,
            parse: Box::new(parse),
            required: false,
            each: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn each(mut self) -> Self {
        self.each = true;
        self
    }
}

/// Run `processors` in order against `target`.
pub fn construct<T>(target: &mut T, data: &Value, processors: &[Processor<'_, T>]) -> Result<()> {
    for processor in processors {
        let value = if processor.required {
            match data.get(processor.field) {
                Some(v) if !v.is_null() && !v.is_unknown() => v,
                _ => {
                    return Err(Error::Validation(format!(
                        "{} is required",
                        processor.field
                    )))
                }
            }
        } else {
            match get_ok(data, processor.field) {
                Some(v) => v,
                None => continue,
            }
        };

        if processor.each {
            for item in value.as_list().unwrap_or(&[]) {
                (processor.parse)(target, item)?;
            }
        } else {
            (processor.parse)(target, value)?;
        }
    }
    Ok(())
}

/// String payload of a value handed to a processor
pub fn as_string(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_string()
}

/// Integer payload of a value handed to a processor
pub fn as_int(value: &Value) -> i64 {
    value.as_i64().unwrap_or_default()
}

/// String map payload of a value handed to a processor
pub fn as_string_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_map()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// String list payload of a value handed to a processor
pub fn as_string_list(value: &Value) -> Vec<String> {
    value
        .as_list()
        .unwrap_or(&[])
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Processors for `name`, `namespace`, `description` and `tags`, shared by
/// every resource backed by a Kubernetes object.
pub fn metadata_processors<'a, K: Resource + 'a>() -> Vec<Processor<'a, K>> {
    vec![
        Processor::new("name", |obj: &mut K, v| {
            obj.meta_mut().name = Some(as_string(v));
            Ok(())
        })
        .required(),
        Processor::new("namespace", |obj: &mut K, v| {
            obj.meta_mut().namespace = Some(as_string(v));
            Ok(())
        }),
        Processor::new("description", |obj: &mut K, v| {
            obj.meta_mut()
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(ANNOTATION_DESCRIPTION.to_string(), as_string(v));
            Ok(())
        }),
        Processor::new("tags", |obj: &mut K, v| {
            let labels = obj.meta_mut().labels.get_or_insert_with(BTreeMap::new);
            for (key, value) in as_string_map(v) {
                labels.insert(format!("{}{}", LABEL_TAG_PREFIX, key), value);
            }
            Ok(())
        }),
    ]
}

/// Metadata of a new namespaced object, defaulting the namespace.
pub fn new_meta(data: &Value) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(
            data.get("namespace")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_NAMESPACE)
                .to_string(),
        ),
        ..Default::default()
    }
}

/// Drop the managed description annotation and tag labels ahead of an
/// update so they are rebuilt from the configuration.
pub fn reset_managed_metadata(meta: &mut ObjectMeta) {
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(ANNOTATION_DESCRIPTION);
    }
    if let Some(labels) = meta.labels.as_mut() {
        labels.retain(|k, _| !k.starts_with(LABEL_TAG_PREFIX));
    }
}

/// Tags configured on a resource, without the label prefix.
pub fn tags(data: &Value) -> BTreeMap<String, String> {
    get_string_map_attr(data, "tags")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{int_value, list_value, make_state, string_map_value, string_value};
    use k8s_openapi::api::core::v1::Secret;

    #[derive(Default)]
    struct Target {
        name: String,
        size: i64,
        nics: Vec<String>,
    }

    fn processors<'a>() -> Vec<Processor<'a, Target>> {
        vec![
            Processor::new("name", |t: &mut Target, v| {
                t.name = as_string(v);
                Ok(())
            })
            .required(),
            Processor::new("size", |t: &mut Target, v| {
                if as_int(v) < 0 {
                    return Err(Error::Validation("size must be positive".into()));
                }
                t.size = as_int(v);
                Ok(())
            }),
            Processor::new("nics", |t: &mut Target, v| {
                t.nics.push(as_string(v));
                Ok(())
            })
            .each(),
        ]
    }

    #[test]
    fn test_construct_in_order() {
        let data = make_state(vec![
            ("name", string_value("vm")),
            ("size", int_value(10)),
            ("nics", list_value(vec![string_value("eth0"), string_value("eth1")])),
        ]);
        let mut target = Target::default();
        construct(&mut target, &data, &processors()).unwrap();
        assert_eq!(target.name, "vm");
        assert_eq!(target.size, 10);
        assert_eq!(target.nics, vec!["eth0", "eth1"]);
    }

    #[test]
    fn test_optional_zero_values_are_skipped() {
        let data = make_state(vec![("name", string_value("vm")), ("size", int_value(0))]);
        let mut target = Target {
            size: 7,
            ..Default::default()
        };
        construct(&mut target, &data, &processors()).unwrap();
        assert_eq!(target.size, 7);
    }

    #[test]
    fn test_required_and_parser_errors() {
        let mut target = Target::default();
        let err = construct(&mut target, &make_state(vec![]), &processors()).unwrap_err();
        assert_eq!(err.to_string(), "name is required");

        let data = make_state(vec![("name", string_value("vm")), ("size", int_value(-1))]);
        let err = construct(&mut target, &data, &processors()).unwrap_err();
        assert!(err.to_string().contains("size must be positive"));
    }

    #[test]
    fn test_metadata_processors() {
        let data = make_state(vec![
            ("name", string_value("userdata")),
            ("namespace", string_value("apps")),
            ("description", string_value("cloud config")),
            (
                "tags",
                string_map_value(&BTreeMap::from([("env".to_string(), "dev".to_string())])),
            ),
        ]);
        let mut secret = Secret::default();
        construct(&mut secret, &data, &metadata_processors()).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("userdata"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("apps"));
        let labels = secret.metadata.labels.clone().unwrap();
        assert_eq!(labels.get("tag.harvesterhci.io/env").map(String::as_str), Some("dev"));

        secret
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("app".into(), "keep".into());
        reset_managed_metadata(&mut secret.metadata);
        let labels = secret.metadata.labels.unwrap();
        assert_eq!(labels.len(), 1);
        assert!(labels.contains_key("app"));
        assert!(secret
            .metadata
            .annotations
            .unwrap()
            .get(ANNOTATION_DESCRIPTION)
            .is_none());
    }
}
