//! Schema declaration engine
//!
//! Resources declare their attributes and nested blocks as plain data. The
//! engine renders them for `GetProviderSchema`, derives data-source schemas,
//! validates configuration and computes plans.

use std::collections::BTreeMap;
use std::sync::Arc;

use harvester_common::constants::DEFAULT_NAMESPACE;

use crate::diagnostics::{attr_step, attribute_error, index_step, path};
use crate::state::{string_value, Value};
use crate::tfplugin6::{self, attribute_path::Step, AttributePath, Diagnostic};
use crate::validators::{self, Validator};

/// Cross-attribute check run against a whole object
pub type ObjectCheck = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Terraform attribute types
#[derive(Debug, Clone, PartialEq)]
pub enum AttrType {
    String,
    Number,
    Bool,
    List(Box<AttrType>),
    Set(Box<AttrType>),
    Map(Box<AttrType>),
    Object(Vec<(String, AttrType)>),
}

impl AttrType {
    pub fn list_of(inner: AttrType) -> Self {
        AttrType::List(Box::new(inner))
    }

    pub fn map_of(inner: AttrType) -> Self {
        AttrType::Map(Box::new(inner))
    }

    /// JSON type constraint as understood by cty
    pub fn to_cty(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            AttrType::String => json!("string"),
            AttrType::Number => json!("number"),
            AttrType::Bool => json!("bool"),
            AttrType::List(t) => json!(["list", t.to_cty()]),
            AttrType::Set(t) => json!(["set", t.to_cty()]),
            AttrType::Map(t) => json!(["map", t.to_cty()]),
            AttrType::Object(fields) => {
                let fields: serde_json::Map<String, serde_json::Value> = fields
                    .iter()
                    .map(|(name, ty)| (name.clone(), ty.to_cty()))
                    .collect();
                json!(["object", fields])
            }
        }
    }

    /// Coerce a value into this type's shape for storing in state.
    pub fn normalize(&self, value: &Value) -> Value {
        match (self, value) {
            (_, Value::Null) | (_, Value::Unknown) => Value::Null,
            (AttrType::String, Value::String(_)) => value.clone(),
            (AttrType::String, Value::Number(n)) => string_value(n.to_string()),
            (AttrType::String, Value::Bool(b)) => string_value(b.to_string()),
            (AttrType::Number, Value::Number(_)) => value.clone(),
            (AttrType::Number, Value::String(s)) => s
                .parse::<i64>()
                .map(|i| Value::Number(i.into()))
                .or_else(|_| s.parse::<f64>().map(crate::state::float_value))
                .unwrap_or(Value::Null),
            (AttrType::Bool, Value::Bool(_)) => value.clone(),
            (AttrType::Bool, Value::String(s)) => match s.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::Null,
            },
            (AttrType::List(t) | AttrType::Set(t), Value::List(items)) => {
                Value::List(items.iter().map(|i| t.normalize(i)).collect())
            }
            (AttrType::Map(t), Value::Map(m)) => {
                Value::Map(m.iter().map(|(k, v)| (k.clone(), t.normalize(v))).collect())
            }
            (AttrType::Object(fields), Value::Map(m)) => Value::Map(
                fields
                    .iter()
                    .map(|(name, ty)| {
                        (name.clone(), ty.normalize(m.get(name).unwrap_or(&Value::Null)))
                    })
                    .collect(),
            ),
            _ => Value::Null,
        }
    }
}

/// A single schema attribute
#[derive(Clone)]
pub struct Attribute {
    pub name: String,
    pub ty: AttrType,
    pub description: String,
    pub required: bool,
    pub optional: bool,
    pub computed: bool,
    pub sensitive: bool,
    pub force_new: bool,
    pub default: Option<Value>,
    pub validators: Vec<Validator>,
    pub conflicts_with: Vec<String>,
}

impl Attribute {
    pub fn new(name: &str, ty: AttrType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            description: String::new(),
            required: false,
            optional: false,
            computed: false,
            sensitive: false,
            force_new: false,
            default: None,
            validators: Vec::new(),
            conflicts_with: Vec::new(),
        }
    }

    pub fn string(name: &str) -> Self {
        Self::new(name, AttrType::String)
    }

    pub fn number(name: &str) -> Self {
        Self::new(name, AttrType::Number)
    }

    pub fn bool(name: &str) -> Self {
        Self::new(name, AttrType::Bool)
    }

    pub fn string_list(name: &str) -> Self {
        Self::new(name, AttrType::list_of(AttrType::String))
    }

    pub fn string_map(name: &str) -> Self {
        Self::new(name, AttrType::map_of(AttrType::String))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self.optional = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self.required = false;
        self
    }

    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Default used when the configuration leaves the attribute null.
    /// Implies optional.
    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self.optional()
    }

    pub fn validate(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn conflicts_with(mut self, others: &[&str]) -> Self {
        self.conflicts_with
            .extend(others.iter().map(|s| s.to_string()));
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    fn to_proto(&self) -> tfplugin6::schema::Attribute {
        tfplugin6::schema::Attribute {
            name: self.name.clone(),
            r#type: self.ty.to_cty().to_string().into_bytes(),
            nested_type: None,
            description: self.description.clone(),
            required: self.required,
            optional: self.optional,
            computed: self.computed,
            sensitive: self.sensitive,
            description_kind: tfplugin6::StringKind::Plain as i32,
            deprecated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Nesting {
    Single,
    List,
    Set,
}

/// A repeated or single nested configuration block
#[derive(Clone)]
pub struct NestedBlock {
    pub name: String,
    pub block: Block,
    pub nesting: Nesting,
    pub min_items: i64,
    pub max_items: i64,
}

impl NestedBlock {
    pub fn list(name: &str, block: Block) -> Self {
        Self {
            name: name.to_string(),
            block,
            nesting: Nesting::List,
            min_items: 0,
            max_items: 0,
        }
    }

    pub fn set(name: &str, block: Block) -> Self {
        Self {
            nesting: Nesting::Set,
            ..Self::list(name, block)
        }
    }

    pub fn single(name: &str, block: Block) -> Self {
        Self {
            nesting: Nesting::Single,
            ..Self::list(name, block)
        }
    }

    pub fn min_items(mut self, n: i64) -> Self {
        self.min_items = n;
        self
    }

    pub fn max_items(mut self, n: i64) -> Self {
        self.max_items = n;
        self
    }

    fn to_proto(&self) -> tfplugin6::schema::NestedBlock {
        use tfplugin6::schema::nested_block::NestingMode;
        let nesting = match self.nesting {
            Nesting::Single => NestingMode::Single,
            Nesting::List => NestingMode::List,
            Nesting::Set => NestingMode::Set,
        };
        tfplugin6::schema::NestedBlock {
            type_name: self.name.clone(),
            block: Some(self.block.to_proto(0)),
            nesting: nesting as i32,
            min_items: self.min_items,
            max_items: self.max_items,
        }
    }

    fn value_type(&self) -> AttrType {
        match self.nesting {
            Nesting::Single => self.block.object_type(),
            _ => AttrType::list_of(self.block.object_type()),
        }
    }
}

/// Attributes and nested blocks at one level of a schema
#[derive(Clone, Default)]
pub struct Block {
    pub attributes: Vec<Attribute>,
    pub blocks: Vec<NestedBlock>,
    pub checks: Vec<ObjectCheck>,
    pub description: String,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn attributes(mut self, attributes: impl IntoIterator<Item = Attribute>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn block(mut self, block: NestedBlock) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn check(mut self, check: ObjectCheck) -> Self {
        self.checks.push(check);
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn find_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn find_block(&self, name: &str) -> Option<&NestedBlock> {
        self.blocks.iter().find(|b| b.name == name)
    }

    fn to_proto(&self, version: i64) -> tfplugin6::schema::Block {
        tfplugin6::schema::Block {
            version,
            attributes: self.attributes.iter().map(Attribute::to_proto).collect(),
            block_types: self.blocks.iter().map(NestedBlock::to_proto).collect(),
            description: self.description.clone(),
            description_kind: tfplugin6::StringKind::Plain as i32,
            deprecated: false,
        }
    }

    /// The object type a value of this block has in state.
    pub fn object_type(&self) -> AttrType {
        let mut fields: Vec<(String, AttrType)> = self
            .attributes
            .iter()
            .map(|a| (a.name.clone(), a.ty.clone()))
            .collect();
        fields.extend(self.blocks.iter().map(|b| (b.name.clone(), b.value_type())));
        AttrType::Object(fields)
    }

    /// Derive the schema of the matching data source: everything computed
    /// except the lookup keys.
    pub fn data_source_block(&self) -> Block {
        let mut attributes: Vec<Attribute> = self
            .attributes
            .iter()
            .map(|a| {
                let mut derived = Attribute::new(&a.name, a.ty.clone()).description(&a.description);
                derived.sensitive = a.sensitive;
                match a.name.as_str() {
                    "name" => derived.required(),
                    "namespace" => derived.optional().computed(),
                    _ => derived.computed(),
                }
            })
            .collect();
        attributes.extend(
            self.blocks.iter().map(|b| {
                Attribute::new(&b.name, AttrType::list_of(b.block.object_type())).computed()
            }),
        );
        Block {
            attributes,
            blocks: Vec::new(),
            checks: Vec::new(),
            description: self.description.clone(),
        }
    }

    /// Run validators and conflict checks, returning attribute-pathed diagnostics.
    pub fn validate(&self, config: &Value) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        self.validate_object(config, &[], &mut diags);
        diags
    }

    fn validate_object(&self, config: &Value, at: &[Step], diags: &mut Vec<Diagnostic>) {
        let null = Value::Null;
        for attr in &self.attributes {
            let value = config.get(&attr.name).unwrap_or(&null);
            let steps = extend(at, attr_step(&attr.name));

            if value.is_null() {
                if attr.required {
                    diags.push(attribute_error(
                        steps,
                        "Missing required argument",
                        format!(
                            "The argument \"{}\" is required, but no definition was found.",
                            attr.name
                        ),
                    ));
                }
                continue;
            }

            if value.is_wholly_known() {
                for validator in &attr.validators {
                    if let Err(msg) = validator(&attr.name, value) {
                        diags.push(attribute_error(steps.clone(), msg, ""));
                    }
                }
            }

            for other in &attr.conflicts_with {
                let conflicting = config.get(other).map(|v| !v.is_null()).unwrap_or(false);
                if conflicting {
                    diags.push(attribute_error(
                        steps.clone(),
                        "Conflicting configuration arguments",
                        format!("\"{}\": conflicts with {}", attr.name, other),
                    ));
                }
            }
        }

        for block in &self.blocks {
            let steps = extend(at, attr_step(&block.name));
            match (block.nesting, config.get(&block.name)) {
                (Nesting::Single, Some(item @ Value::Map(_))) => {
                    block.block.validate_object(item, &steps, diags);
                }
                (Nesting::List | Nesting::Set, Some(Value::List(items))) => {
                    check_item_count(block, items.len(), &steps, diags);
                    for (i, item) in items.iter().enumerate() {
                        block
                            .block
                            .validate_object(item, &extend(&steps, index_step(i)), diags);
                    }
                }
                (Nesting::List | Nesting::Set, Some(Value::Unknown)) => {}
                (_, _) => check_item_count(block, 0, &steps, diags),
            }
        }

        if config.is_wholly_known() {
            for check in &self.checks {
                if let Err(msg) = check(config) {
                    diags.push(attribute_error(at.to_vec(), msg, ""));
                }
            }
        }
    }

    /// Plan a change. Returns the planned state and the attribute paths whose
    /// change forces replacement.
    pub fn plan(&self, prior: &Value, proposed: &Value) -> (Value, Vec<AttributePath>) {
        if proposed.is_null() {
            return (Value::Null, Vec::new());
        }
        let create = prior.is_null();
        let mut replace = Vec::new();
        let mut planned = self.plan_object(prior, proposed, create, &[], &mut replace);

        if !create {
            if &planned == prior {
                return (prior.clone(), Vec::new());
            }
            // Something changes; computed values left unset are recomputed by apply.
            if let Value::Map(m) = &mut planned {
                for attr in self.attributes.iter().filter(|a| a.computed) {
                    if let Some(v) = m.get_mut(&attr.name) {
                        if v.is_null() {
                            *v = Value::Unknown;
                        }
                    }
                }
            }
        }
        (planned, replace.into_iter().map(path).collect())
    }

    fn plan_object(
        &self,
        prior: &Value,
        proposed: &Value,
        create: bool,
        at: &[Step],
        replace: &mut Vec<Vec<Step>>,
    ) -> Value {
        let null = Value::Null;
        let mut out = BTreeMap::new();

        for attr in &self.attributes {
            let before = prior.get(&attr.name).unwrap_or(&null);
            let mut value = proposed.get(&attr.name).cloned().unwrap_or_default();

            if value.is_null() {
                if let Some(default) = &attr.default {
                    value = default.clone();
                }
            }
            if value.is_null() && attr.computed && create {
                value = Value::Unknown;
            }
            // Null and zero values are the same thing to the legacy SDK.
            if !create && !before.is_null() && value.is_zero() && before.is_zero() {
                value = before.clone();
            }
            if attr.force_new && !create && &value != before {
                replace.push(extend(at, attr_step(&attr.name)));
            }
            out.insert(attr.name.clone(), value);
        }

        for block in &self.blocks {
            let steps = extend(at, attr_step(&block.name));
            let before = prior.get(&block.name).unwrap_or(&null);
            let value = match (block.nesting, proposed.get(&block.name)) {
                (Nesting::Single, Some(item @ Value::Map(_))) => {
                    block
                        .block
                        .plan_object(before, item, create || before.is_null(), &steps, replace)
                }
                (Nesting::Single, _) => Value::Null,
                (_, Some(Value::List(items))) => {
                    let prior_items = before.as_list().unwrap_or(&[]);
                    Value::List(
                        items
                            .iter()
                            .enumerate()
                            .map(|(i, item)| {
                                let prior_item = prior_items.get(i).unwrap_or(&null);
                                block.block.plan_object(
                                    prior_item,
                                    item,
                                    prior_item.is_null(),
                                    &extend(&steps, index_step(i)),
                                    replace,
                                )
                            })
                            .collect(),
                    )
                }
                (_, Some(Value::Unknown)) => Value::Unknown,
                (_, _) => Value::List(Vec::new()),
            };
            out.insert(block.name.clone(), value);
        }

        Value::Map(out)
    }

    /// Shape a value to this block: every attribute present, unknown keys
    /// dropped, unknowns nulled, absent list blocks empty.
    pub fn normalize(&self, value: &Value) -> Value {
        let Value::Map(m) = value else {
            return Value::Null;
        };
        let null = Value::Null;
        let mut out = BTreeMap::new();
        for attr in &self.attributes {
            out.insert(
                attr.name.clone(),
                attr.ty.normalize(m.get(&attr.name).unwrap_or(&null)),
            );
        }
        for block in &self.blocks {
            let item = m.get(&block.name).unwrap_or(&null);
            let normalized = match block.nesting {
                Nesting::Single => block.block.normalize(item),
                Nesting::List | Nesting::Set => Value::List(
                    item.as_list()
                        .unwrap_or(&[])
                        .iter()
                        .map(|i| block.block.normalize(i))
                        .collect(),
                ),
            };
            out.insert(block.name.clone(), normalized);
        }
        Value::Map(out)
    }
}

fn extend(at: &[Step], step: Step) -> Vec<Step> {
    let mut steps = at.to_vec();
    steps.push(step);
    steps
}

fn check_item_count(block: &NestedBlock, count: usize, at: &[Step], diags: &mut Vec<Diagnostic>) {
    let count = count as i64;
    if block.min_items > 0 && count < block.min_items {
        diags.push(attribute_error(
            at.to_vec(),
            "Insufficient blocks",
            format!(
                "At least {} \"{}\" blocks are required.",
                block.min_items, block.name
            ),
        ));
    }
    if block.max_items > 0 && count > block.max_items {
        diags.push(attribute_error(
            at.to_vec(),
            "Too many blocks",
            format!(
                "No more than {} \"{}\" blocks are allowed.",
                block.max_items, block.name
            ),
        ));
    }
}

/// A versioned resource, data source or provider schema
#[derive(Clone)]
pub struct Schema {
    pub version: i64,
    pub block: Block,
}

impl Schema {
    pub fn new(block: Block) -> Self {
        Self { version: 0, block }
    }

    pub fn to_proto(&self) -> tfplugin6::Schema {
        tfplugin6::Schema {
            version: self.version,
            block: Some(self.block.to_proto(self.version)),
        }
    }

    pub fn data_source(&self) -> Schema {
        Schema::new(self.block.data_source_block())
    }
}

/// `id`, `name`, `namespace`, `description`, `tags`, `state` and `message`
/// carried by every namespaced resource.
pub fn namespaced_attributes() -> Vec<Attribute> {
    let mut attrs = cluster_attributes();
    attrs.insert(
        2,
        Attribute::string("namespace")
            .default(string_value(DEFAULT_NAMESPACE))
            .force_new()
            .validate(validators::dns1123()),
    );
    attrs
}

/// Common attributes of cluster-scoped resources
pub fn cluster_attributes() -> Vec<Attribute> {
    vec![
        Attribute::string("id").computed(),
        Attribute::string("name")
            .required()
            .force_new()
            .validate(validators::dns1123())
            .description("A unique name"),
        Attribute::string("description")
            .optional()
            .description("Any text you want that better describes this resource"),
        Attribute::string_map("tags").optional(),
        Attribute::string("state").computed(),
        Attribute::string("message").computed(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{int_value, list_value, make_state};

    fn sample() -> Block {
        Block::new()
            .attributes(namespaced_attributes())
            .attribute(
                Attribute::number("vlan_id")
                    .required()
                    .validate(validators::int_between(0, 4094)),
            )
            .attribute(
                Attribute::string("user_data")
                    .optional()
                    .conflicts_with(&["user_data_base64"]),
            )
            .attribute(Attribute::string("user_data_base64").optional())
            .block(NestedBlock::list(
                "disk",
                Block::new()
                    .attribute(Attribute::string("name").required())
                    .attribute(Attribute::string("volume_name").optional().computed()),
            ))
    }

    #[test]
    fn test_cty_types() {
        assert_eq!(AttrType::String.to_cty(), serde_json::json!("string"));
        assert_eq!(
            AttrType::map_of(AttrType::String).to_cty(),
            serde_json::json!(["map", "string"])
        );
        let obj = AttrType::Object(vec![("port".into(), AttrType::Number)]);
        assert_eq!(
            AttrType::list_of(obj).to_cty(),
            serde_json::json!(["list", ["object", {"port": "number"}]])
        );
    }

    #[test]
    fn test_validate_range_message() {
        let config = make_state(vec![("name", string_value("net")), ("vlan_id", int_value(4095))]);
        let diags = sample().validate(&config);
        assert_eq!(diags.len(), 1);
        assert_eq!(
            diags[0].summary,
            "expected vlan_id to be in the range (0 - 4094), got 4095"
        );
        assert!(diags[0].attribute.is_some());
    }

    #[test]
    fn test_validate_skips_unknown_values() {
        let config = make_state(vec![("name", string_value("net")), ("vlan_id", Value::Unknown)]);
        assert!(sample().validate(&config).is_empty());
    }

    #[test]
    fn test_validate_required_and_conflicts() {
        let config = make_state(vec![
            ("vlan_id", int_value(1)),
            ("user_data", string_value("a")),
            ("user_data_base64", string_value("YQ==")),
        ]);
        let diags = sample().validate(&config);
        assert!(diags.iter().any(|d| d.summary == "Missing required argument"));
        assert!(diags
            .iter()
            .any(|d| d.detail.contains("conflicts with user_data_base64")));
    }

    #[test]
    fn test_plan_create_fills_defaults_and_unknowns() {
        let proposed = make_state(vec![
            ("name", string_value("net")),
            ("vlan_id", int_value(10)),
            (
                "disk",
                list_value(vec![make_state(vec![("name", string_value("rootdisk"))])]),
            ),
        ]);
        let (planned, replace) = sample().plan(&Value::Null, &proposed);
        assert!(replace.is_empty());
        assert_eq!(planned.get("namespace"), Some(&string_value("default")));
        assert_eq!(planned.get("id"), Some(&Value::Unknown));
        let disk = &planned.get("disk").unwrap().as_list().unwrap()[0];
        assert_eq!(disk.get("volume_name"), Some(&Value::Unknown));
    }

    #[test]
    fn test_plan_force_new_change_requires_replace() {
        let prior = make_state(vec![
            ("id", string_value("default/net")),
            ("name", string_value("net")),
            ("namespace", string_value("default")),
            ("vlan_id", int_value(10)),
            ("state", string_value("Active")),
        ]);
        let mut proposed = prior.clone();
        proposed.set("name", string_value("net2"));
        let (_, replace) = sample().plan(&prior, &proposed);
        assert_eq!(replace.len(), 1);
        assert_eq!(replace[0].steps[0], attr_step("name"));
    }

    #[test]
    fn test_plan_no_change_returns_prior() {
        let prior = sample().normalize(&make_state(vec![
            ("id", string_value("default/net")),
            ("name", string_value("net")),
            ("namespace", string_value("default")),
            ("description", string_value("")),
            ("vlan_id", int_value(10)),
        ]));
        let mut proposed = prior.clone();
        // config leaves description unset; "" and null must not diff
        proposed.set("description", Value::Null);
        let (planned, replace) = sample().plan(&prior, &proposed);
        assert_eq!(planned, prior);
        assert!(replace.is_empty());
    }

    #[test]
    fn test_normalize_fills_and_drops() {
        let value = make_state(vec![
            ("name", string_value("x")),
            ("vlan_id", string_value("12")),
            ("bogus", string_value("dropped")),
            ("state", Value::Unknown),
        ]);
        let normalized = sample().normalize(&value);
        assert!(normalized.get("bogus").is_none());
        assert_eq!(normalized.get("vlan_id"), Some(&int_value(12)));
        assert_eq!(normalized.get("state"), Some(&Value::Null));
        assert_eq!(normalized.get("disk"), Some(&list_value(vec![])));
        assert_eq!(normalized.get("tags"), Some(&Value::Null));
    }

    #[test]
    fn test_data_source_block() {
        let ds = sample().data_source_block();
        let name = ds.find_attribute("name").unwrap();
        assert!(name.required && !name.computed);
        let namespace = ds.find_attribute("namespace").unwrap();
        assert!(namespace.optional && namespace.computed && namespace.default.is_none());
        let vlan = ds.find_attribute("vlan_id").unwrap();
        assert!(vlan.computed && !vlan.required && vlan.validators.is_empty());
        let disk = ds.find_attribute("disk").unwrap();
        assert!(disk.computed);
        assert!(matches!(disk.ty, AttrType::List(_)));
        assert!(ds.blocks.is_empty());
    }

    #[test]
    fn test_to_proto() {
        let proto = Schema::new(sample()).to_proto();
        let block = proto.block.unwrap();
        let vlan = block.attributes.iter().find(|a| a.name == "vlan_id").unwrap();
        assert_eq!(vlan.r#type, b"\"number\"".to_vec());
        assert!(vlan.required);
        assert_eq!(block.block_types[0].type_name, "disk");
    }
}
