//! Provides a dynamic value type abstraction.
//!
//! This module gives access to a dynamically typed value which is used by
//! the template engine during execution.  Models handed to the engine are
//! converted into [`Value`]s through serde, which means that any type that
//! implements [`Serialize`](serde::Serialize) can be used as a model.
//!
//! # Records and bags
//!
//! Maps come in two flavors which decide how missing attributes behave:
//!
//! * **Records** are produced from Rust structs.  They carry the name of
//!   the struct as type name which is what `@model` declarations are
//!   checked against.  Accessing a field a record does not have is an
//!   error unless the template is compiled against a dynamic model and
//!   the engine tolerates missing properties.
//! * **Bags** are produced from maps, JSON objects and the
//!   [`model!`](crate::model!) macro.  They behave like anonymous objects:
//!   with missing property tolerance enabled a missing key yields an empty
//!   value that can be accessed further and renders as empty string.
//!
//! ```
//! # use minirazor::value::Value;
//! #[derive(serde::Serialize)]
//! struct Person {
//!     forename: String,
//! }
//!
//! let value = Value::from_serialize(&Person { forename: "Ada".into() });
//! assert_eq!(value.type_name(), Some("Person"));
//! assert_eq!(value.get_attr("forename").unwrap().as_str(), Some("Ada"));
//! ```
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, ErrorKind};

pub use crate::value::serialize::serializing_for_value;

mod ops;
mod serialize;

pub(crate) use self::ops::*;

/// The map type used by values.
#[cfg(not(feature = "preserve_order"))]
pub type ValueMap = std::collections::BTreeMap<Arc<str>, Value>;

/// The map type used by values.
#[cfg(feature = "preserve_order")]
pub type ValueMap = indexmap::IndexMap<Arc<str>, Value>;

/// Describes the kind of a map value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapType {
    /// An anonymous object.
    Bag,
    /// A typed object carrying the name of its type.
    Record(Arc<str>),
}

/// Describes the kind of a string value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StringType {
    /// A plain string that is encoded when emitted.
    Normal,
    /// The string is already encoded and is emitted verbatim.
    Safe,
}

/// Describes the kind of value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValueKind {
    /// The placeholder produced by a tolerated missing property.
    Missing,
    /// The none value.
    None,
    /// A boolean.
    Bool,
    /// An integer or a float.
    Number,
    /// A string, normal or safe.
    String,
    /// A sequence of values.
    Seq,
    /// A bag or a record.
    Map,
    /// A value that failed to convert.
    Invalid,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            ValueKind::Missing => "missing",
            ValueKind::None => "null",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Seq => "sequence",
            ValueKind::Map => "map",
            ValueKind::Invalid => "invalid value",
        })
    }
}

#[derive(Clone)]
pub(crate) enum ValueRepr {
    Missing,
    None,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(Arc<str>, StringType),
    Seq(Arc<Vec<Value>>),
    Map(Arc<ValueMap>, MapType),
    Invalid(Arc<str>),
}

/// Represents a dynamically typed value in the template engine.
#[derive(Clone)]
pub struct Value(pub(crate) ValueRepr);

/// Controls how attribute lookups treat absent attributes.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct Lookup {
    /// Missing properties on bags become [`Value::MISSING`].
    pub tolerant: bool,
    /// The template runs against a dynamic model, records are walked like bags.
    pub dynamic: bool,
}

impl Lookup {
    fn may_miss(self, map_type: &MapType) -> bool {
        self.tolerant && (self.dynamic || matches!(map_type, MapType::Bag))
    }
}

impl Value {
    /// The null value.
    pub const NONE: Value = Value(ValueRepr::None);

    /// The placeholder for a tolerated missing property.
    pub const MISSING: Value = Value(ValueRepr::Missing);

    /// Creates a value from a map and a map type.
    pub fn from_map(map: ValueMap, map_type: MapType) -> Value {
        Value(ValueRepr::Map(Arc::new(map), map_type))
    }

    /// Creates an anonymous (bag style) map value from key value pairs.
    pub fn from_bag<K, I>(iter: I) -> Value
    where
        K: Into<Arc<str>>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::from_map(
            iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            MapType::Bag,
        )
    }

    /// Creates a typed record value from a type name and fields.
    pub fn from_record<K, I>(type_name: &str, iter: I) -> Value
    where
        K: Into<Arc<str>>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::from_map(
            iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            MapType::Record(Arc::from(type_name)),
        )
    }

    /// Creates a value from a safe string.
    ///
    /// A safe string is one that is already encoded and will be emitted
    /// as is by the engine regardless of the configured encoding.
    pub fn from_safe_string(value: String) -> Value {
        Value(ValueRepr::String(Arc::from(value), StringType::Safe))
    }

    pub(crate) fn from_invalid(message: impl Into<Arc<str>>) -> Value {
        Value(ValueRepr::Invalid(message.into()))
    }

    /// Parses a JSON document into a value.
    ///
    /// JSON objects become bags.
    pub fn from_json_str(source: &str) -> Result<Value, Error> {
        serde_json::from_str::<serde_json::Value>(source)
            .map(|value| Value::from_serialize(&value))
            .map_err(|err| {
                Error::new(ErrorKind::BadSerialization, "could not parse JSON model")
                    .with_source(err)
            })
    }

    /// Returns the kind of the value.
    pub fn kind(&self) -> ValueKind {
        match self.0 {
            ValueRepr::Missing => ValueKind::Missing,
            ValueRepr::None => ValueKind::None,
            ValueRepr::Bool(_) => ValueKind::Bool,
            ValueRepr::I64(_) | ValueRepr::F64(_) => ValueKind::Number,
            ValueRepr::String(..) => ValueKind::String,
            ValueRepr::Seq(_) => ValueKind::Seq,
            ValueRepr::Map(..) => ValueKind::Map,
            ValueRepr::Invalid(_) => ValueKind::Invalid,
        }
    }

    /// Is this value null?
    pub fn is_none(&self) -> bool {
        matches!(self.0, ValueRepr::None)
    }

    /// Is this the placeholder of a missing property?
    pub fn is_missing(&self) -> bool {
        matches!(self.0, ValueRepr::Missing)
    }

    /// Is this value a safe (pre-encoded) string?
    pub fn is_safe(&self) -> bool {
        matches!(self.0, ValueRepr::String(_, StringType::Safe))
    }

    /// Is this value considered true?
    pub fn is_true(&self) -> bool {
        match self.0 {
            ValueRepr::Bool(val) => val,
            ValueRepr::I64(x) => x != 0,
            ValueRepr::F64(x) => x != 0.0,
            ValueRepr::String(ref x, _) => !x.is_empty(),
            ValueRepr::Seq(ref x) => !x.is_empty(),
            ValueRepr::Map(..) => true,
            ValueRepr::Missing | ValueRepr::None | ValueRepr::Invalid(_) => false,
        }
    }

    /// If the value is a boolean, returns it.
    pub fn as_bool(&self) -> Option<bool> {
        match self.0 {
            ValueRepr::Bool(val) => Some(val),
            _ => None,
        }
    }

    /// If the value is an integer, returns it.
    pub fn as_i64(&self) -> Option<i64> {
        match self.0 {
            ValueRepr::I64(val) => Some(val),
            ValueRepr::F64(val) if val.fract() == 0.0 && val.abs() < i64::MAX as f64 => {
                Some(val as i64)
            }
            _ => None,
        }
    }

    /// If the value is a number, returns it as float.
    pub fn as_f64(&self) -> Option<f64> {
        match self.0 {
            ValueRepr::I64(val) => Some(val as f64),
            ValueRepr::F64(val) => Some(val),
            _ => None,
        }
    }

    /// If the value is a string, returns it.
    pub fn as_str(&self) -> Option<&str> {
        match self.0 {
            ValueRepr::String(ref s, _) => Some(s),
            _ => None,
        }
    }

    /// If the value is a sequence, returns its items.
    pub fn as_slice(&self) -> Option<&[Value]> {
        match self.0 {
            ValueRepr::Seq(ref items) => Some(&items[..]),
            _ => None,
        }
    }

    /// If the value is a map, returns it.
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self.0 {
            ValueRepr::Map(ref map, _) => Some(map),
            _ => None,
        }
    }

    /// If the value is a map, returns its map type.
    pub fn map_type(&self) -> Option<&MapType> {
        match self.0 {
            ValueRepr::Map(_, ref map_type) => Some(map_type),
            _ => None,
        }
    }

    /// Returns the type name of a record.
    pub fn type_name(&self) -> Option<&str> {
        match self.0 {
            ValueRepr::Map(_, MapType::Record(ref name)) => Some(name),
            _ => None,
        }
    }

    /// Returns the length of the contained value.
    ///
    /// Strings report the number of characters.
    pub fn len(&self) -> Option<usize> {
        match self.0 {
            ValueRepr::String(ref s, _) => Some(s.chars().count()),
            ValueRepr::Seq(ref items) => Some(items.len()),
            ValueRepr::Map(ref items, _) => Some(items.len()),
            _ => None,
        }
    }

    /// Checks that neither this value nor any value it contains failed
    /// to convert.
    pub fn validate(&self) -> Result<(), Error> {
        match self.0 {
            ValueRepr::Invalid(ref reason) => Err(Error::new(
                ErrorKind::BadSerialization,
                reason.to_string(),
            )),
            ValueRepr::Seq(ref items) => items.iter().try_for_each(Value::validate),
            ValueRepr::Map(ref map, _) => map.values().try_for_each(Value::validate),
            _ => Ok(()),
        }
    }

    /// Looks up an attribute by name.
    ///
    /// This is the strict variant of attribute lookup: absent attributes
    /// are always an error.
    pub fn get_attr(&self, name: &str) -> Result<Value, Error> {
        self.get_attr_with(name, Lookup::default())
    }

    pub(crate) fn get_attr_with(&self, name: &str, lookup: Lookup) -> Result<Value, Error> {
        match self.0 {
            ValueRepr::Missing => Ok(Value::MISSING),
            ValueRepr::Map(ref map, ref map_type) => match map.get(name) {
                Some(value) => Ok(value.clone()),
                None if lookup.may_miss(map_type) => Ok(Value::MISSING),
                None => Err(Error::new(
                    ErrorKind::UndefinedError,
                    match map_type {
                        MapType::Record(type_name) => {
                            format!("type {:?} has no property {:?}", type_name, name)
                        }
                        MapType::Bag => format!("object has no property {:?}", name),
                    },
                )),
            },
            ValueRepr::String(..) | ValueRepr::Seq(_)
                if name == "Length" || name == "Count" =>
            {
                Ok(Value::from(self.len().unwrap_or(0) as i64))
            }
            ValueRepr::None => Err(Error::new(
                ErrorKind::UndefinedError,
                format!("cannot access property {:?} of null", name),
            )),
            ValueRepr::Invalid(ref reason) => {
                Err(Error::new(ErrorKind::BadSerialization, reason.to_string()))
            }
            _ => Err(Error::new(
                ErrorKind::UndefinedError,
                format!("{} has no property {:?}", self.kind(), name),
            )),
        }
    }

    pub(crate) fn get_item_with(&self, key: &Value, lookup: Lookup) -> Result<Value, Error> {
        match (&self.0, &key.0) {
            (ValueRepr::Missing, _) => Ok(Value::MISSING),
            (ValueRepr::Map(..), ValueRepr::String(name, _)) => {
                self.get_attr_with(name, lookup)
            }
            (ValueRepr::Seq(items), _) => {
                let item = key
                    .as_i64()
                    .and_then(|idx| usize::try_from(idx).ok())
                    .and_then(|idx| items.get(idx));
                match item {
                    Some(item) => Ok(item.clone()),
                    None if lookup.tolerant && lookup.dynamic => Ok(Value::MISSING),
                    None => Err(Error::new(
                        ErrorKind::UndefinedError,
                        format!("index {} is out of range", key),
                    )),
                }
            }
            (ValueRepr::String(s, _), _) => {
                let item = key
                    .as_i64()
                    .and_then(|idx| usize::try_from(idx).ok())
                    .and_then(|idx| s.chars().nth(idx));
                match item {
                    Some(c) => Ok(Value::from(c.to_string())),
                    None => Err(Error::new(
                        ErrorKind::UndefinedError,
                        format!("index {} is out of range", key),
                    )),
                }
            }
            (ValueRepr::None, _) => Err(Error::new(
                ErrorKind::UndefinedError,
                format!("cannot index null with {}", key),
            )),
            _ => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("cannot index {} with {}", self.kind(), key.kind()),
            )),
        }
    }

    /// Returns the items to iterate over in a `@foreach` loop.
    ///
    /// Maps iterate as `KeyValuePair` records with `Key` and `Value`.
    pub(crate) fn try_iter(&self) -> Result<Vec<Value>, Error> {
        match self.0 {
            ValueRepr::Seq(ref items) => Ok(items.to_vec()),
            ValueRepr::Map(ref map, _) => Ok(map
                .iter()
                .map(|(key, value)| {
                    Value::from_record(
                        "KeyValuePair",
                        [("Key", Value::from(key.clone())), ("Value", value.clone())],
                    )
                })
                .collect()),
            ValueRepr::String(ref s, _) => Ok(s.chars().map(|c| Value::from(c.to_string())).collect()),
            ValueRepr::Missing => Ok(Vec::new()),
            ValueRepr::Invalid(ref reason) => {
                Err(Error::new(ErrorKind::BadSerialization, reason.to_string()))
            }
            _ => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("cannot iterate over {}", self.kind()),
            )),
        }
    }
}

impl Default for Value {
    fn default() -> Value {
        Value::NONE
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            ValueRepr::Missing => f.write_str("Missing"),
            ValueRepr::None => f.write_str("None"),
            ValueRepr::Bool(val) => fmt::Debug::fmt(&val, f),
            ValueRepr::I64(val) => fmt::Debug::fmt(&val, f),
            ValueRepr::F64(val) => fmt::Debug::fmt(&val, f),
            ValueRepr::String(ref val, _) => fmt::Debug::fmt(val, f),
            ValueRepr::Seq(ref items) => f.debug_list().entries(items.iter()).finish(),
            ValueRepr::Map(ref map, ref map_type) => {
                if let MapType::Record(name) = map_type {
                    f.write_str(name)?;
                    f.write_str(" ")?;
                }
                f.debug_map().entries(map.iter()).finish()
            }
            ValueRepr::Invalid(ref reason) => write!(f, "<invalid value: {}>", reason),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            ValueRepr::Missing | ValueRepr::None => Ok(()),
            ValueRepr::Bool(val) => fmt::Display::fmt(&val, f),
            ValueRepr::I64(val) => fmt::Display::fmt(&val, f),
            ValueRepr::F64(val) => fmt::Display::fmt(&val, f),
            ValueRepr::String(ref val, _) => f.write_str(val),
            ValueRepr::Seq(ref items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{:?}", item)?;
                }
                f.write_str("]")
            }
            ValueRepr::Map(_, MapType::Record(ref name)) => f.write_str(name),
            ValueRepr::Map(ref map, MapType::Bag) => {
                f.write_str("{")?;
                for (idx, (key, value)) in map.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{:?}: {:?}", key, value)?;
                }
                f.write_str("}")
            }
            ValueRepr::Invalid(ref reason) => write!(f, "<invalid value: {}>", reason),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (ValueRepr::Missing, ValueRepr::Missing) => true,
            (ValueRepr::None, ValueRepr::None) => true,
            (ValueRepr::Bool(a), ValueRepr::Bool(b)) => a == b,
            (ValueRepr::String(a, _), ValueRepr::String(b, _)) => a == b,
            (ValueRepr::Seq(a), ValueRepr::Seq(b)) => a == b,
            (ValueRepr::Map(a, at), ValueRepr::Map(b, bt)) => at == bt && a == b,
            _ => match coerce(self, other) {
                Some(CoerceResult::I64(a, b)) => a == b,
                Some(CoerceResult::F64(a, b)) => a == b,
                None => false,
            },
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (&self.0, &other.0) {
            (ValueRepr::String(a, _), ValueRepr::String(b, _)) => a.partial_cmp(b),
            (ValueRepr::Bool(a), ValueRepr::Bool(b)) => a.partial_cmp(b),
            _ => match coerce(self, other) {
                Some(CoerceResult::I64(a, b)) => a.partial_cmp(&b),
                Some(CoerceResult::F64(a, b)) => a.partial_cmp(&b),
                None => None,
            },
        }
    }
}

macro_rules! value_from {
    ($src:ty, $dst:ident) => {
        impl From<$src> for Value {
            #[inline(always)]
            fn from(val: $src) -> Self {
                Value(ValueRepr::$dst(val as _))
            }
        }
    };
}

value_from!(bool, Bool);
value_from!(i8, I64);
value_from!(i16, I64);
value_from!(i32, I64);
value_from!(i64, I64);
value_from!(u8, I64);
value_from!(u16, I64);
value_from!(u32, I64);
value_from!(f32, F64);
value_from!(f64, F64);

impl From<()> for Value {
    fn from(_: ()) -> Value {
        Value::NONE
    }
}

impl From<char> for Value {
    fn from(val: char) -> Value {
        Value::from(val.to_string())
    }
}

impl<'a> From<&'a str> for Value {
    fn from(val: &'a str) -> Value {
        Value(ValueRepr::String(Arc::from(val), StringType::Normal))
    }
}

impl From<String> for Value {
    fn from(val: String) -> Value {
        Value(ValueRepr::String(Arc::from(val), StringType::Normal))
    }
}

impl From<Arc<str>> for Value {
    fn from(val: Arc<str>) -> Value {
        Value(ValueRepr::String(val, StringType::Normal))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(val: Vec<T>) -> Value {
        Value(ValueRepr::Seq(Arc::new(
            val.into_iter().map(Into::into).collect(),
        )))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(val: Option<T>) -> Value {
        match val {
            Some(val) => val.into(),
            None => Value::NONE,
        }
    }
}

impl<T: Into<Value>> FromIterator<T> for Value {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Value {
        Value(ValueRepr::Seq(Arc::new(
            iter.into_iter().map(Into::into).collect(),
        )))
    }
}
