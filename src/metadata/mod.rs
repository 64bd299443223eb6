//! Per-resource schema.
//!
//! A resource is described by a table of [`PropertyDescriptor`]s built at program start.
//! [`Metadata`] wraps that table, adds the system properties every resource carries, and
//! provides lookup, validation of incoming `{name: value}` maps, conversion between
//! typed [`Value`]s and their on-disk JSON form, and iteration filtered by
//! [`PropertyKind`]. Metadata never changes at runtime; a schema change goes through a
//! layout migration.

pub mod typecast;

pub use typecast::{BlobRef, Converter, Typecast, Value};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::BitOr;

use thiserror::Error;

/// Metadata errors.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Duplicate property name: {0}")]
    DuplicateName(String),

    #[error("Duplicate slot {slot} on property {property}")]
    DuplicateSlot { property: String, slot: u32 },

    #[error("Duplicate prefix '{prefix}' on property {property}")]
    DuplicatePrefix { property: String, prefix: String },

    #[error("Reserved {what} used by property {property}")]
    Reserved { property: String, what: String },

    #[error("Unknown property: {0}")]
    UnknownProperty(String),

    #[error("Invalid value for {property}: {reason}")]
    InvalidValue { property: String, reason: String },
}

pub type MetadataResult<T> = Result<T, MetadataError>;

pub const GUID: &str = "guid";
pub const CTIME: &str = "ctime";
pub const MTIME: &str = "mtime";
pub const SEQNO: &str = "seqno";
pub const LAYER: &str = "layer";
pub const AUTHOR: &str = "author";

/// Permission bitmask checked at command dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Permission(u8);

impl Permission {
    pub const NONE: Permission = Permission(0);
    pub const CREATE: Permission = Permission(1);
    pub const WRITE: Permission = Permission(1 << 1);
    pub const READ: Permission = Permission(1 << 2);
    /// Requires an authenticated principal.
    pub const AUTH: Permission = Permission(1 << 3);
    /// Requires the principal to be listed in the document's `author`.
    pub const AUTHOR: Permission = Permission(1 << 4);
    /// Only reachable through a local mount.
    pub const LOCAL: Permission = Permission(1 << 5);
    pub const PUBLIC: Permission = Permission(1 | (1 << 1) | (1 << 2));

    pub fn contains(self, other: Permission) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Permission {
    type Output = Permission;

    fn bitor(self, rhs: Permission) -> Permission {
        Permission(self.0 | rhs.0)
    }
}

/// Kinds used to filter the property table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyKind {
    /// Has a metadata file on disk (everything but aggregated properties).
    Stored,
    /// Has a slot or a prefix.
    Indexed,
    Blob,
    Aggregated,
    Localized,
}

/// Declarative description of one property.
#[derive(Clone, Debug)]
pub struct PropertyDescriptor {
    pub name: String,
    pub slot: Option<u32>,
    pub prefix: Option<String>,
    pub full_text: bool,
    pub boolean: bool,
    pub typecast: Typecast,
    pub default: Option<serde_json::Value>,
    pub localized: bool,
    pub permissions: Permission,
    pub blob: bool,
    pub aggregated: bool,
    pub system: bool,
    pub mime_type: Option<String>,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, typecast: Typecast) -> Self {
        Self {
            name: name.into(),
            slot: None,
            prefix: None,
            full_text: false,
            boolean: false,
            typecast,
            default: None,
            localized: false,
            permissions: Permission::PUBLIC,
            blob: false,
            aggregated: false,
            system: false,
            mime_type: None,
        }
    }

    /// A BLOB property; never indexed, never returned inline.
    pub fn blob(name: impl Into<String>, mime_type: impl Into<String>) -> Self {
        let mut prop = Self::new(name, Typecast::Str);
        prop.blob = true;
        prop.mime_type = Some(mime_type.into());
        prop.default = Some(serde_json::Value::Null);
        prop
    }

    /// An aggregated property holding a set of child ids.
    pub fn aggregated(name: impl Into<String>) -> Self {
        let mut prop = Self::new(name, Typecast::List(Box::new(Typecast::Str)));
        prop.aggregated = true;
        prop.default = Some(serde_json::json!([]));
        prop
    }

    pub fn slot(mut self, slot: u32) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn full_text(mut self) -> Self {
        self.full_text = true;
        self
    }

    pub fn boolean(mut self) -> Self {
        self.boolean = true;
        self
    }

    pub fn localized(mut self) -> Self {
        self.localized = true;
        self
    }

    pub fn default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn permissions(mut self, permissions: Permission) -> Self {
        self.permissions = permissions;
        self
    }

    fn system(mut self) -> Self {
        self.system = true;
        self
    }

    pub fn is_indexed(&self) -> bool {
        !self.blob && (self.slot.is_some() || self.prefix.is_some() || self.full_text)
    }

    pub fn is_kind(&self, kind: PropertyKind) -> bool {
        match kind {
            PropertyKind::Stored => !self.aggregated,
            PropertyKind::Indexed => self.is_indexed(),
            PropertyKind::Blob => self.blob,
            PropertyKind::Aggregated => self.aggregated,
            PropertyKind::Localized => self.localized,
        }
    }

    /// Coerces an incoming JSON value according to this descriptor.
    ///
    /// Localized properties accept either a `{lang: text}` map or a plain string, which
    /// is assigned to `default_lang`.
    pub fn coerce(&self, input: &serde_json::Value, default_lang: &str) -> Result<Value, String> {
        if self.blob {
            return match input {
                serde_json::Value::Null => Ok(Value::Null),
                serde_json::Value::String(url) => Ok(Value::Blob(BlobRef {
                    url: Some(url.clone()),
                    mime_type: self.mime_type.clone().unwrap_or_default(),
                    ..Default::default()
                })),
                other => serde_json::from_value::<BlobRef>(other.clone())
                    .map(Value::Blob)
                    .map_err(|e| format!("invalid blob reference: {}", e)),
            };
        }

        if self.aggregated {
            return match self.typecast.cast(input)? {
                Value::List(items) => Ok(Value::Aggregate(
                    items.iter().flat_map(Value::term_strings).collect(),
                )),
                other => Ok(Value::Aggregate(other.term_strings().into_iter().collect())),
            };
        }

        if self.localized {
            return match input {
                serde_json::Value::Object(map) => {
                    let mut translations = BTreeMap::new();
                    for (lang, text) in map {
                        match self.typecast.cast(text)? {
                            Value::Str(s) => {
                                translations.insert(lang.clone(), s);
                            }
                            other => {
                                return Err(format!(
                                    "localized value must be text, got {:?}",
                                    other
                                ))
                            }
                        }
                    }
                    Ok(Value::Localized(translations))
                }
                serde_json::Value::Null => Ok(Value::Localized(BTreeMap::new())),
                scalar => match self.typecast.cast(scalar)? {
                    Value::Str(s) => {
                        let mut translations = BTreeMap::new();
                        translations.insert(default_lang.to_string(), s);
                        Ok(Value::Localized(translations))
                    }
                    other => Err(format!("localized value must be text, got {:?}", other)),
                },
            };
        }

        if input.is_null() {
            return Ok(Value::Null);
        }

        self.typecast.cast(input)
    }
}

/// Whether a validation is for a new document or an update of an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidateMode {
    Create,
    Update,
}

/// One failed property in a validation pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationFailure {
    pub property: String,
    pub reason: String,
}

/// Schema of one resource.
#[derive(Clone, Debug)]
pub struct Metadata {
    name: String,
    props: Vec<PropertyDescriptor>,
    by_name: HashMap<String, usize>,
}

impl Metadata {
    /// Builds the schema, prepending the system properties and checking that names,
    /// slots and prefixes are unique.
    pub fn new(name: impl Into<String>, props: Vec<PropertyDescriptor>) -> MetadataResult<Self> {
        let name = name.into();

        let mut all = system_properties();
        let has_author = props.iter().any(|p| p.name == AUTHOR);
        if !has_author {
            all.push(
                PropertyDescriptor::new(AUTHOR, Typecast::List(Box::new(Typecast::Str)))
                    .prefix("A")
                    .boolean()
                    .default(serde_json::json!([]))
                    .permissions(Permission::CREATE | Permission::READ)
                    .system(),
            );
        }

        let mut names = HashSet::new();
        let mut slots = HashSet::new();
        let mut prefixes = HashSet::new();

        for (idx, prop) in props.into_iter().enumerate() {
            if prop.slot == Some(0) {
                return Err(MetadataError::Reserved {
                    property: prop.name,
                    what: "slot 0".to_string(),
                });
            }
            if prop.prefix.as_deref() == Some("I") {
                return Err(MetadataError::Reserved {
                    property: prop.name,
                    what: "prefix I".to_string(),
                });
            }
            if prop.blob && (prop.slot.is_some() || prop.prefix.is_some() || prop.full_text) {
                return Err(MetadataError::Reserved {
                    property: prop.name,
                    what: format!("index attributes on blob property (#{})", idx),
                });
            }
            all.push(prop);
        }

        for prop in &all {
            if !names.insert(prop.name.clone()) {
                return Err(MetadataError::DuplicateName(prop.name.clone()));
            }
            if let Some(slot) = prop.slot {
                if !slots.insert(slot) {
                    return Err(MetadataError::DuplicateSlot {
                        property: prop.name.clone(),
                        slot,
                    });
                }
            }
            if let Some(prefix) = &prop.prefix {
                if !prefixes.insert(prefix.clone()) {
                    return Err(MetadataError::DuplicatePrefix {
                        property: prop.name.clone(),
                        prefix: prefix.clone(),
                    });
                }
            }
        }

        let by_name = all
            .iter()
            .enumerate()
            .map(|(idx, prop)| (prop.name.clone(), idx))
            .collect();

        Ok(Self {
            name,
            props: all,
            by_name,
        })
    }

    /// Resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.by_name.get(name).map(|idx| &self.props[*idx])
    }

    pub fn require(&self, name: &str) -> MetadataResult<&PropertyDescriptor> {
        self.get(name)
            .ok_or_else(|| MetadataError::UnknownProperty(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.props.iter()
    }

    pub fn iter_kind(&self, kind: PropertyKind) -> impl Iterator<Item = &PropertyDescriptor> {
        self.props.iter().filter(move |prop| prop.is_kind(kind))
    }

    /// Looks a property up by its term prefix.
    pub fn by_prefix(&self, prefix: &str) -> Option<&PropertyDescriptor> {
        self.props
            .iter()
            .find(|prop| prop.prefix.as_deref() == Some(prefix))
    }

    /// Validates an incoming mapping.
    ///
    /// On create, missing properties take their default; a non-system property with no
    /// default is mandatory. System properties other than `guid`, `layer` and `author`
    /// are never writable, and `guid` is immutable after create.
    pub fn validate(
        &self,
        input: &serde_json::Map<String, serde_json::Value>,
        mode: ValidateMode,
        default_lang: &str,
    ) -> Result<BTreeMap<String, Value>, Vec<ValidationFailure>> {
        let mut failures = Vec::new();
        let mut typed = BTreeMap::new();

        for (name, raw) in input {
            let Some(prop) = self.get(name) else {
                failures.push(ValidationFailure {
                    property: name.clone(),
                    reason: "unknown property".to_string(),
                });
                continue;
            };

            let writable = match name.as_str() {
                GUID => mode == ValidateMode::Create,
                CTIME | MTIME | SEQNO => false,
                _ => true,
            };
            if !writable {
                failures.push(ValidationFailure {
                    property: name.clone(),
                    reason: "property is read-only".to_string(),
                });
                continue;
            }

            match prop.coerce(raw, default_lang) {
                Ok(value) => {
                    typed.insert(name.clone(), value);
                }
                Err(reason) => failures.push(ValidationFailure {
                    property: name.clone(),
                    reason,
                }),
            }
        }

        if mode == ValidateMode::Create {
            for prop in &self.props {
                if typed.contains_key(&prop.name) || (prop.system && prop.default.is_none()) {
                    continue;
                }
                match &prop.default {
                    Some(default) => match prop.coerce(default, default_lang) {
                        Ok(value) => {
                            typed.insert(prop.name.clone(), value);
                        }
                        Err(reason) => failures.push(ValidationFailure {
                            property: prop.name.clone(),
                            reason: format!("bad default: {}", reason),
                        }),
                    },
                    None => failures.push(ValidationFailure {
                        property: prop.name.clone(),
                        reason: "property is mandatory".to_string(),
                    }),
                }
            }
        }

        if failures.is_empty() {
            Ok(typed)
        } else {
            Err(failures)
        }
    }

    /// Serializes a typed value to its on-disk JSON form.
    pub fn encode(&self, name: &str, value: &Value) -> MetadataResult<serde_json::Value> {
        self.require(name)?;
        Ok(value.to_json())
    }

    /// Parses the on-disk JSON form back into a typed value.
    pub fn decode(
        &self,
        name: &str,
        raw: &serde_json::Value,
        default_lang: &str,
    ) -> MetadataResult<Value> {
        let prop = self.require(name)?;
        prop.coerce(raw, default_lang)
            .map_err(|reason| MetadataError::InvalidValue {
                property: name.to_string(),
                reason,
            })
    }
}

fn system_properties() -> Vec<PropertyDescriptor> {
    vec![
        PropertyDescriptor::new(GUID, Typecast::Str)
            .slot(0)
            .prefix("I")
            .boolean()
            .permissions(Permission::CREATE | Permission::READ)
            .system(),
        PropertyDescriptor::new(CTIME, Typecast::Int)
            .slot(1)
            .prefix("C")
            .boolean()
            .permissions(Permission::READ)
            .system(),
        PropertyDescriptor::new(MTIME, Typecast::Int)
            .slot(2)
            .prefix("M")
            .boolean()
            .permissions(Permission::READ)
            .system(),
        PropertyDescriptor::new(SEQNO, Typecast::Int)
            .slot(3)
            .prefix("S")
            .boolean()
            .permissions(Permission::READ)
            .system(),
        PropertyDescriptor::new(LAYER, Typecast::List(Box::new(Typecast::Str)))
            .prefix("L")
            .boolean()
            .default(serde_json::json!(["public"]))
            .system(),
    ]
}

/// Returns the active child ids of an aggregated value, or an empty set.
pub fn aggregate_ids(value: &Value) -> BTreeSet<String> {
    match value {
        Value::Aggregate(ids) => ids.clone(),
        other => other.term_strings().into_iter().collect(),
    }
}
