//! Named, typed property storage.
//!
//! Every owner in the world (tile, zone, layer, the world itself) carries a
//! [`PropertyBag`]. Bags only store local definitions; ancestor-chain lookup
//! and copy-on-write live in the world map, which owns all the registries
//! and can walk the inheritance DAG.

use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::error::{MapError, MapResult};
use crate::xml::XmlNode;

/// A dynamically typed property value.
///
/// The type of a property is fixed by its first definition; later writes
/// assert the same variant, mirroring a runtime type check.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Packed ARGB color
    Color(u32),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "Bool",
            PropertyValue::Int(_) => "Int",
            PropertyValue::Float(_) => "Float",
            PropertyValue::Text(_) => "Text",
            PropertyValue::Color(_) => "Color",
        }
    }

    pub fn same_type(&self, other: &PropertyValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Parse a value from its XML `Type`/`Value` attribute pair.
    pub fn parse(type_name: &str, text: &str) -> MapResult<Self> {
        let bad = |msg: &str| MapError::Parse(format!("property value '{}': {}", text, msg));
        match type_name {
            "Bool" => text.parse().map(PropertyValue::Bool).map_err(|_| bad("not a bool")),
            "Int" => text.parse().map(PropertyValue::Int).map_err(|_| bad("not an integer")),
            "Float" => text.parse().map(PropertyValue::Float).map_err(|_| bad("not a float")),
            "Text" => Ok(PropertyValue::Text(text.to_string())),
            "Color" => u32::from_str_radix(text.trim_start_matches("0x"), 16)
                .map(PropertyValue::Color)
                .map_err(|_| bad("not a hex color")),
            other => Err(MapError::Parse(format!("unknown property type '{}'", other))),
        }
    }

    /// Render the value for its XML `Value` attribute.
    pub fn value_string(&self) -> String {
        match self {
            PropertyValue::Bool(v) => v.to_string(),
            PropertyValue::Int(v) => v.to_string(),
            PropertyValue::Float(v) => v.to_string(),
            PropertyValue::Text(v) => v.clone(),
            PropertyValue::Color(v) => format!("0x{:08x}", v),
        }
    }
}

/// A local name -> value store for one owner.
///
/// Iteration order is the name order, which keeps XML output stable.
#[derive(Clone, Debug, Default)]
pub struct PropertyBag {
    values: BTreeMap<String, PropertyValue>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    /// Define a property, creating it or replacing it wholesale.
    ///
    /// Used when first introducing a name, and by copy-on-write when pulling
    /// an ancestor's definition into a local bag.
    pub fn define(&mut self, name: &str, value: PropertyValue) {
        self.values.insert(name.to_string(), value);
    }

    /// Overwrite an existing property with a value of the same type.
    pub fn set(&mut self, name: &str, value: PropertyValue) {
        let existing = self
            .values
            .get_mut(name)
            .unwrap_or_else(|| panic!("set on undefined property '{}'", name));
        assert!(
            existing.same_type(&value),
            "property '{}' is {}, cannot assign {}",
            name,
            existing.type_name(),
            value.type_name()
        );
        *existing = value;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, PropertyValue> {
        self.values.iter()
    }
}

/// Append one `<Property>` child per entry, in name order.
pub fn write_properties(bag: &PropertyBag, parent: &mut XmlNode) {
    for (name, value) in bag.iter() {
        parent.push(
            XmlNode::new("Property")
                .with_attr("Name", name)
                .with_attr("Type", value.type_name())
                .with_attr("Value", value.value_string()),
        );
    }
}

/// Collect the `<Property>` children of an element into a bag.
pub fn read_properties(parent: &XmlNode) -> MapResult<PropertyBag> {
    let mut bag = PropertyBag::new();
    for node in parent.children_named("Property") {
        let name = node.require_attr("Name")?;
        let value = PropertyValue::parse(node.require_attr("Type")?, node.require_attr("Value")?)?;
        bag.define(name, value);
    }
    Ok(bag)
}
