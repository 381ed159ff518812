//! Resource identities, property values and resource specifications.
//!
//! A [`ResourceSpec`] is the desired description of one resource. Property
//! values may contain structured [`ResourceRef`] pointers to another
//! resource's output attribute; these pointers are what the graph builder
//! scans to infer dependencies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::SpecError;

/// Key used for the object form of a reference: `{"$ref": "kind.name.attribute"}`.
pub const REF_KEY: &str = "$ref";

/// Identity of a resource: its kind plus a logical name unique within a stack.
///
/// Rendered and persisted as `kind.name`. Ordering follows the rendered
/// string so that every tie-break in the engine is reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    kind: String,
    name: String,
}

/// Structured pointer to an output attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    /// Resource whose output is referenced.
    pub target: ResourceId,
    /// Output attribute name (`id` is the physical id).
    pub attribute: String,
}

/// A property value: literal JSON-like data or a reference.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Explicit null.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Numeric literal.
    Number(serde_json::Number),
    /// String literal.
    String(String),
    /// Ordered list of values.
    List(Vec<PropertyValue>),
    /// Nested map of values.
    Map(BTreeMap<String, PropertyValue>),
    /// Reference to another resource's output attribute.
    Reference(ResourceRef),
}

/// Desired description of a single resource. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    id: ResourceId,
    properties: BTreeMap<String, PropertyValue>,
    explicit_deps: BTreeSet<ResourceId>,
}

/// The set of resource specs making up one stack, keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct SpecSet {
    specs: BTreeMap<ResourceId, ResourceSpec>,
}

impl ResourceId {
    /// Creates an identity from a kind and a name.
    ///
    /// # Errors
    ///
    /// Returns an error if either part breaks the naming rules.
    pub fn new(kind: &str, name: &str) -> Result<Self, SpecError> {
        if !is_valid_name(kind) {
            return Err(SpecError::identity(
                format!("{kind}.{name}"),
                format!("kind '{kind}' must be lowercase alphanumeric with single hyphens, starting with a letter"),
            ));
        }
        if !is_valid_name(name) {
            return Err(SpecError::identity(
                format!("{kind}.{name}"),
                format!("name '{name}' must be lowercase alphanumeric with single hyphens, starting with a letter"),
            ));
        }

        Ok(Self {
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }

    /// Parses an identity from its `kind.name` form.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not exactly `kind.name`.
    pub fn parse(s: &str) -> Result<Self, SpecError> {
        match s.split_once('.') {
            Some((kind, name)) if !name.contains('.') => Self::new(kind, name),
            _ => Err(SpecError::identity(s, "expected the form kind.name")),
        }
    }

    /// Resource kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn rendered_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.kind
            .bytes()
            .chain(std::iter::once(b'.'))
            .chain(self.name.bytes())
    }
}

impl Ord for ResourceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rendered_bytes().cmp(other.rendered_bytes())
    }
}

impl PartialOrd for ResourceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = SpecError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

impl std::str::FromStr for ResourceId {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl ResourceRef {
    /// Parses a reference from `kind.name.attribute`.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason if the text is not a valid pointer.
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(String::from("expected kind.name.attribute"));
        }

        let target = ResourceId::new(parts[0], parts[1]).map_err(|e| e.to_string())?;
        let attribute = parts[2];
        if !is_valid_attribute(attribute) {
            return Err(format!(
                "attribute '{attribute}' must be lowercase alphanumeric with '_' or '-', starting with a letter"
            ));
        }

        Ok(Self {
            target,
            attribute: attribute.to_string(),
        })
    }

    /// Returns the inline token form, `${kind.name.attribute}`.
    #[must_use]
    pub fn token(&self) -> String {
        format!("${{{self}}}")
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

impl PropertyValue {
    /// Converts raw JSON into a property value, extracting reference pointers.
    ///
    /// `resource` and `path` only feed error messages.
    ///
    /// # Errors
    ///
    /// Returns an error if a reference token is malformed.
    pub fn from_json(value: &Value, resource: &str, path: &str) -> Result<Self, SpecError> {
        let malformed = |token: &str, reason: String| SpecError::MalformedReference {
            resource: resource.to_string(),
            property: path.to_string(),
            token: token.to_string(),
            reason,
        };

        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => Ok(Self::Number(n.clone())),
            Value::String(s) => Self::from_str_literal(s).map_err(|reason| malformed(s, reason)),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| Self::from_json(item, resource, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Value::Object(map) => {
                if let Some(target) = map.get(REF_KEY) {
                    if map.len() != 1 {
                        return Err(malformed(
                            &value.to_string(),
                            format!("a '{REF_KEY}' object must not carry other keys"),
                        ));
                    }
                    let Value::String(pointer) = target else {
                        return Err(malformed(
                            &target.to_string(),
                            format!("'{REF_KEY}' must be a string"),
                        ));
                    };
                    return ResourceRef::parse(pointer)
                        .map(Self::Reference)
                        .map_err(|reason| malformed(pointer, reason));
                }

                map.iter()
                    .map(|(key, item)| {
                        Self::from_json(item, resource, &format!("{path}.{key}"))
                            .map(|parsed| (key.clone(), parsed))
                    })
                    .collect::<Result<BTreeMap<_, _>, _>>()
                    .map(Self::Map)
            }
        }
    }

    /// Interprets a string literal: a whole `${...}` token is a reference,
    /// `$${` escapes a literal `${`, anything else containing `${` is rejected.
    fn from_str_literal(s: &str) -> Result<Self, String> {
        if !s.replace("$${", "").contains("${") {
            return Ok(Self::String(s.replace("$${", "${")));
        }

        let inner = s
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
            .filter(|inner| !inner.contains("${") && !inner.contains('}'))
            .ok_or_else(|| {
                String::from("a reference must be the whole value, written ${kind.name.attribute}")
            })?;

        ResourceRef::parse(inner).map(Self::Reference)
    }

    /// Returns the canonical JSON form used for persistence and comparison.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::Reference(r) => {
                let mut object = serde_json::Map::new();
                object.insert(REF_KEY.to_string(), Value::String(r.to_string()));
                Value::Object(object)
            }
        }
    }

    /// Resolves every reference through `lookup`, producing concrete JSON.
    ///
    /// # Errors
    ///
    /// Returns the first reference `lookup` could not resolve, with its reason.
    pub fn resolve<F>(&self, lookup: &F) -> Result<Value, (ResourceRef, String)>
    where
        F: Fn(&ResourceRef) -> Result<Value, String>,
    {
        match self {
            Self::Reference(r) => lookup(r).map_err(|reason| (r.clone(), reason)),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(map) => map
                .iter()
                .map(|(k, v)| v.resolve(lookup).map(|resolved| (k.clone(), resolved)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
            literal => Ok(literal.to_json()),
        }
    }

    /// Returns true if this value contains any reference to `target`.
    #[must_use]
    pub fn refers_to(&self, target: &ResourceId) -> bool {
        match self {
            Self::Reference(r) => r.target == *target,
            Self::List(items) => items.iter().any(|item| item.refers_to(target)),
            Self::Map(map) => map.values().any(|item| item.refers_to(target)),
            _ => false,
        }
    }

    fn collect_references<'a>(&'a self, path: String, out: &mut Vec<(String, &'a ResourceRef)>) {
        match self {
            Self::Reference(r) => out.push((path, r)),
            Self::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.collect_references(format!("{path}[{i}]"), out);
                }
            }
            Self::Map(map) => {
                for (key, item) in map {
                    item.collect_references(format!("{path}.{key}"), out);
                }
            }
            _ => {}
        }
    }
}

impl ResourceSpec {
    /// Creates a spec from raw JSON properties and `kind.name` dependency strings.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed identities, property names or reference tokens.
    pub fn new<'d>(
        kind: &str,
        name: &str,
        properties: &BTreeMap<String, Value>,
        explicit_deps: impl IntoIterator<Item = &'d str>,
    ) -> Result<Self, SpecError> {
        let id = ResourceId::new(kind, name)?;
        let rendered = id.to_string();

        let mut parsed = BTreeMap::new();
        for (key, raw) in properties {
            if key.is_empty() || key.starts_with('$') {
                return Err(SpecError::InvalidProperty {
                    resource: rendered,
                    property: key.clone(),
                });
            }
            parsed.insert(key.clone(), PropertyValue::from_json(raw, &rendered, key)?);
        }

        let explicit_deps = explicit_deps
            .into_iter()
            .map(ResourceId::parse)
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(Self {
            id,
            properties: parsed,
            explicit_deps,
        })
    }

    /// Resource identity.
    #[must_use]
    pub const fn id(&self) -> &ResourceId {
        &self.id
    }

    /// Resource kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.id.kind()
    }

    /// Declared properties.
    #[must_use]
    pub const fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    /// Dependencies declared with `depends_on`.
    #[must_use]
    pub const fn explicit_dependencies(&self) -> &BTreeSet<ResourceId> {
        &self.explicit_deps
    }

    /// Every reference in the properties, with the property path holding it.
    #[must_use]
    pub fn references(&self) -> Vec<(String, &ResourceRef)> {
        let mut out = Vec::new();
        for (key, value) in &self.properties {
            value.collect_references(key.clone(), &mut out);
        }
        out
    }

    /// Canonical JSON form of the properties, as persisted in state.
    #[must_use]
    pub fn canonical_properties(&self) -> BTreeMap<String, Value> {
        self.properties
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

impl SpecSet {
    /// Creates an empty spec set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a resource within this set.
    ///
    /// # Errors
    ///
    /// Returns an error if `(kind, name)` is already defined or the spec is malformed.
    pub fn define_resource<'d>(
        &mut self,
        kind: &str,
        name: &str,
        properties: &BTreeMap<String, Value>,
        explicit_deps: impl IntoIterator<Item = &'d str>,
    ) -> Result<&ResourceSpec, SpecError> {
        let spec = ResourceSpec::new(kind, name, properties, explicit_deps)?;
        self.insert(spec)
    }

    /// Adds an already-built spec.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity is already defined.
    pub fn insert(&mut self, spec: ResourceSpec) -> Result<&ResourceSpec, SpecError> {
        match self.specs.entry(spec.id.clone()) {
            std::collections::btree_map::Entry::Occupied(_) => {
                Err(SpecError::DuplicateResource { id: spec.id })
            }
            std::collections::btree_map::Entry::Vacant(slot) => Ok(slot.insert(spec)),
        }
    }

    /// Looks up a spec by identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceSpec> {
        self.specs.get(id)
    }

    /// Iterates specs in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.specs.values()
    }

    /// Number of specs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Returns true if no resources are defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
pub(crate) fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    // Rest must be lowercase alphanumeric or hyphen
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

fn is_valid_attribute(attribute: &str) -> bool {
    let mut chars = attribute.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).expect("object")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("vpc"));
        assert!(is_valid_name("db-credentials"));
        assert!(is_valid_name("subnet-2"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Vpc"));
        assert!(!is_valid_name("2vpc"));
        assert!(!is_valid_name("db_credentials"));
        assert!(!is_valid_name("vpc-"));
        assert!(!is_valid_name("db--main"));
        assert!(!is_valid_name("a.b"));
    }

    #[test]
    fn test_identity_ordering_follows_rendered_string() {
        let a = ResourceId::new("a", "b").expect("valid");
        let b = ResourceId::new("a-x", "c").expect("valid");
        // "a-x.c" < "a.b" because '-' sorts before '.'
        assert!(b < a);
        assert_eq!(a.to_string().cmp(&b.to_string()), a.cmp(&b));
    }

    #[test]
    fn test_identity_parse() {
        let id = ResourceId::parse("database.main").expect("valid");
        assert_eq!(id.kind(), "database");
        assert_eq!(id.name(), "main");
        assert!(ResourceId::parse("database").is_err());
        assert!(ResourceId::parse("a.b.c").is_err());
    }

    #[test]
    fn test_inline_reference_token() {
        let value = PropertyValue::from_json(&json!("${database.main.endpoint}"), "service.api", "env")
            .expect("valid reference");
        let PropertyValue::Reference(r) = value else {
            panic!("expected a reference");
        };
        assert_eq!(r.target.to_string(), "database.main");
        assert_eq!(r.attribute, "endpoint");
        assert_eq!(r.token(), "${database.main.endpoint}");
    }

    #[test]
    fn test_object_reference_form() {
        let value = PropertyValue::from_json(&json!({"$ref": "network.vpc.id"}), "cluster.main", "vpc")
            .expect("valid reference");
        assert_eq!(value.to_json(), json!({"$ref": "network.vpc.id"}));
    }

    #[test]
    fn test_malformed_references_rejected() {
        for raw in [
            json!("${network.vpc}"),
            json!("prefix-${network.vpc.id}"),
            json!("${Network.vpc.id}"),
            json!({"$ref": 42}),
            json!({"$ref": "network.vpc.id", "extra": true}),
        ] {
            let result = PropertyValue::from_json(&raw, "cluster.main", "vpc");
            assert!(
                matches!(result, Err(SpecError::MalformedReference { .. })),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_escaped_literal() {
        let value = PropertyValue::from_json(&json!("echo $${HOME}"), "task.main", "command")
            .expect("escaped literal");
        assert_eq!(value, PropertyValue::String(String::from("echo ${HOME}")));
    }

    #[test]
    fn test_references_report_paths() {
        let spec = ResourceSpec::new(
            "service",
            "api",
            &props(json!({
                "env": {"DB_HOST": "${database.main.endpoint}"},
                "subnets": ["${network.vpc.private-a}", "literal"],
            })),
            ["cluster.main"],
        )
        .expect("valid spec");

        let refs: Vec<(String, String)> = spec
            .references()
            .into_iter()
            .map(|(path, r)| (path, r.to_string()))
            .collect();
        assert_eq!(
            refs,
            vec![
                (String::from("env.DB_HOST"), String::from("database.main.endpoint")),
                (String::from("subnets[0]"), String::from("network.vpc.private-a")),
            ]
        );
        assert_eq!(spec.explicit_dependencies().len(), 1);
    }

    #[test]
    fn test_resolve_substitutes_outputs() {
        let value = PropertyValue::from_json(
            &json!({"host": "${database.main.endpoint}", "port": 5432}),
            "service.api",
            "db",
        )
        .expect("valid");

        let resolved = value
            .resolve(&|r: &ResourceRef| {
                if r.attribute == "endpoint" {
                    Ok(json!("db.internal"))
                } else {
                    Err(String::from("unknown attribute"))
                }
            })
            .expect("resolvable");
        assert_eq!(resolved, json!({"host": "db.internal", "port": 5432}));
    }

    #[test]
    fn test_define_resource_rejects_duplicates() {
        let mut set = SpecSet::new();
        set.define_resource("network", "vpc", &BTreeMap::new(), [])
            .expect("first definition");
        let err = set
            .define_resource("network", "vpc", &BTreeMap::new(), [])
            .expect_err("duplicate");
        assert!(matches!(err, SpecError::DuplicateResource { .. }));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_invalid_property_name() {
        let err = ResourceSpec::new("network", "vpc", &props(json!({"$weird": 1})), [])
            .expect_err("invalid property");
        assert!(matches!(err, SpecError::InvalidProperty { .. }));
    }
}
