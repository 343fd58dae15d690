use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{ser, Serialize, Serializer};

use crate::utils::{untrusted_size_hint, OnDrop};
use crate::value::{MapType, StringType, Value, ValueMap, ValueRepr};

// Values nested in serializable models are passed through in-band so that
// record types and safe strings survive a trip through serde.
const VALUE_HANDLE_MARKER: &str = "\x01__minirazor_ValueHandle";

thread_local! {
    static INTERNAL_SERIALIZATION: Cell<bool> = const { Cell::new(false) };
    static LAST_VALUE_HANDLE: Cell<u32> = const { Cell::new(0) };
    static VALUE_HANDLES: RefCell<BTreeMap<u32, Value>> = const { RefCell::new(BTreeMap::new()) };
}

fn mark_internal_serialization() -> impl Drop {
    let old = INTERNAL_SERIALIZATION.with(|flag| {
        let old = flag.get();
        flag.set(true);
        old
    });
    OnDrop::new(move || {
        if !old {
            INTERNAL_SERIALIZATION.with(|flag| flag.set(false));
        }
    })
}

/// Function that returns true when serialization for [`Value`] is taking place.
///
/// The engine converts every model through serde.  A [`Serialize`]
/// implementation can call this to produce a representation tailored for
/// templates that differs from what is normally written to disk.
pub fn serializing_for_value() -> bool {
    INTERNAL_SERIALIZATION.with(|flag| flag.get())
}

fn transform<T: Serialize + ?Sized>(value: &T) -> Value {
    match value.serialize(ValueSerializer) {
        Ok(rv) => rv,
        Err(invalid) => Value::from_invalid(invalid.0),
    }
}

impl Value {
    /// Creates a value from something that can be serialized.
    ///
    /// Structs become records carrying the struct name as type name, maps
    /// become bags.  This never fails: if the [`Serialize`] implementation
    /// reports an error the value (or the nested part of it) is marked as
    /// invalid.  Invalid values fail when the engine touches them and can
    /// be checked upfront with [`Value::validate`].
    ///
    /// ```
    /// # use minirazor::value::Value;
    /// let val = Value::from_serialize(&vec![1, 2, 3]);
    /// assert_eq!(val.len(), Some(3));
    /// ```
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Value {
        let _serialization_guard = mark_internal_serialization();
        transform(value)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializing_for_value() {
            let handle = LAST_VALUE_HANDLE.with(|x| {
                let rv = x.get().wrapping_add(1);
                x.set(rv);
                rv
            });
            VALUE_HANDLES.with(|handles| handles.borrow_mut().insert(handle, self.clone()));
            return serializer.serialize_unit_variant(
                VALUE_HANDLE_MARKER,
                handle,
                VALUE_HANDLE_MARKER,
            );
        }

        match self.0 {
            ValueRepr::Bool(b) => serializer.serialize_bool(b),
            ValueRepr::I64(i) => serializer.serialize_i64(i),
            ValueRepr::F64(f) => serializer.serialize_f64(f),
            ValueRepr::None | ValueRepr::Missing | ValueRepr::Invalid(_) => {
                serializer.serialize_unit()
            }
            ValueRepr::String(ref s, _) => serializer.serialize_str(s),
            ValueRepr::Seq(ref items) => items.serialize(serializer),
            ValueRepr::Map(ref entries, _) => {
                use serde::ser::SerializeMap;
                let mut map = ok!(serializer.serialize_map(Some(entries.len())));
                for (k, v) in entries.iter() {
                    ok!(map.serialize_entry(&**k, v));
                }
                map.end()
            }
        }
    }
}

/// The error a value that failed to convert carries.
#[derive(Debug)]
pub struct InvalidValue(Arc<str>);

impl std::error::Error for InvalidValue {}

impl fmt::Display for InvalidValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl ser::Error for InvalidValue {
    fn custom<T>(msg: T) -> Self
    where
        T: fmt::Display,
    {
        InvalidValue(Arc::from(msg.to_string()))
    }
}

fn key_to_string(key: Value) -> Option<Arc<str>> {
    match key.0 {
        ValueRepr::String(s, _) => Some(s),
        ValueRepr::I64(_) | ValueRepr::F64(_) | ValueRepr::Bool(_) => {
            Some(Arc::from(key.to_string()))
        }
        _ => None,
    }
}

fn string(value: &str) -> Value {
    Value(ValueRepr::String(Arc::from(value), StringType::Normal))
}

struct ValueSerializer;

impl Serializer for ValueSerializer {
    type Ok = Value;
    type Error = InvalidValue;

    type SerializeSeq = SerializeSeq;
    type SerializeTuple = SerializeSeq;
    type SerializeTupleStruct = SerializeSeq;
    type SerializeTupleVariant = SerializeTupleVariant;
    type SerializeMap = SerializeMap;
    type SerializeStruct = SerializeStruct;
    type SerializeStructVariant = SerializeStruct;

    fn serialize_bool(self, v: bool) -> Result<Value, InvalidValue> {
        Ok(Value(ValueRepr::Bool(v)))
    }

    fn serialize_i8(self, v: i8) -> Result<Value, InvalidValue> {
        Ok(Value(ValueRepr::I64(v as i64)))
    }

    fn serialize_i16(self, v: i16) -> Result<Value, InvalidValue> {
        Ok(Value(ValueRepr::I64(v as i64)))
    }

    fn serialize_i32(self, v: i32) -> Result<Value, InvalidValue> {
        Ok(Value(ValueRepr::I64(v as i64)))
    }

    fn serialize_i64(self, v: i64) -> Result<Value, InvalidValue> {
        Ok(Value(ValueRepr::I64(v)))
    }

    fn serialize_u8(self, v: u8) -> Result<Value, InvalidValue> {
        Ok(Value(ValueRepr::I64(v as i64)))
    }

    fn serialize_u16(self, v: u16) -> Result<Value, InvalidValue> {
        Ok(Value(ValueRepr::I64(v as i64)))
    }

    fn serialize_u32(self, v: u32) -> Result<Value, InvalidValue> {
        Ok(Value(ValueRepr::I64(v as i64)))
    }

    fn serialize_u64(self, v: u64) -> Result<Value, InvalidValue> {
        Ok(match i64::try_from(v) {
            Ok(v) => Value(ValueRepr::I64(v)),
            Err(_) => Value(ValueRepr::F64(v as f64)),
        })
    }

    fn serialize_f32(self, v: f32) -> Result<Value, InvalidValue> {
        Ok(Value(ValueRepr::F64(v as f64)))
    }

    fn serialize_f64(self, v: f64) -> Result<Value, InvalidValue> {
        Ok(Value(ValueRepr::F64(v)))
    }

    fn serialize_char(self, v: char) -> Result<Value, InvalidValue> {
        Ok(Value::from(v))
    }

    fn serialize_str(self, value: &str) -> Result<Value, InvalidValue> {
        Ok(string(value))
    }

    fn serialize_bytes(self, value: &[u8]) -> Result<Value, InvalidValue> {
        Ok(Value::from(String::from_utf8_lossy(value).into_owned()))
    }

    fn serialize_none(self) -> Result<Value, InvalidValue> {
        Ok(Value::NONE)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<Value, InvalidValue> {
        Ok(transform(value))
    }

    fn serialize_unit(self) -> Result<Value, InvalidValue> {
        Ok(Value::NONE)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Value, InvalidValue> {
        Ok(Value::NONE)
    }

    fn serialize_unit_variant(
        self,
        name: &'static str,
        variant_index: u32,
        variant: &'static str,
    ) -> Result<Value, InvalidValue> {
        if name == VALUE_HANDLE_MARKER && variant == VALUE_HANDLE_MARKER {
            VALUE_HANDLES
                .with(|handles| handles.borrow_mut().remove(&variant_index))
                .ok_or_else(|| InvalidValue(Arc::from("value handle not in registry")))
        } else {
            Ok(string(variant))
        }
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Value, InvalidValue> {
        Ok(transform(value))
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value, InvalidValue> {
        let mut map = ValueMap::new();
        map.insert(Arc::from(variant), transform(value));
        Ok(Value::from_map(map, MapType::Bag))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SerializeSeq, InvalidValue> {
        Ok(SerializeSeq {
            elements: Vec::with_capacity(untrusted_size_hint(len.unwrap_or(0))),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SerializeSeq, InvalidValue> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SerializeSeq, InvalidValue> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SerializeTupleVariant, InvalidValue> {
        Ok(SerializeTupleVariant {
            name: variant,
            fields: Vec::with_capacity(untrusted_size_hint(len)),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<SerializeMap, InvalidValue> {
        Ok(SerializeMap {
            entries: ValueMap::new(),
            key: None,
        })
    }

    fn serialize_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<SerializeStruct, InvalidValue> {
        Ok(SerializeStruct {
            name,
            fields: ValueMap::new(),
        })
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<SerializeStruct, InvalidValue> {
        Ok(SerializeStruct {
            name: variant,
            fields: ValueMap::new(),
        })
    }
}

struct SerializeSeq {
    elements: Vec<Value>,
}

impl ser::SerializeSeq for SerializeSeq {
    type Ok = Value;
    type Error = InvalidValue;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), InvalidValue> {
        self.elements.push(transform(value));
        Ok(())
    }

    fn end(self) -> Result<Value, InvalidValue> {
        Ok(Value(ValueRepr::Seq(Arc::new(self.elements))))
    }
}

impl ser::SerializeTuple for SerializeSeq {
    type Ok = Value;
    type Error = InvalidValue;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), InvalidValue> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value, InvalidValue> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SerializeSeq {
    type Ok = Value;
    type Error = InvalidValue;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), InvalidValue> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value, InvalidValue> {
        ser::SerializeSeq::end(self)
    }
}

struct SerializeTupleVariant {
    name: &'static str,
    fields: Vec<Value>,
}

impl ser::SerializeTupleVariant for SerializeTupleVariant {
    type Ok = Value;
    type Error = InvalidValue;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), InvalidValue> {
        self.fields.push(transform(value));
        Ok(())
    }

    fn end(self) -> Result<Value, InvalidValue> {
        let mut map = ValueMap::new();
        map.insert(Arc::from(self.name), Value::from(self.fields));
        Ok(Value::from_map(map, MapType::Bag))
    }
}

struct SerializeMap {
    entries: ValueMap,
    key: Option<Arc<str>>,
}

impl ser::SerializeMap for SerializeMap {
    type Ok = Value;
    type Error = InvalidValue;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), InvalidValue> {
        self.key = key.serialize(ValueSerializer).ok().and_then(key_to_string);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), InvalidValue> {
        if let Some(key) = self.key.take() {
            self.entries.insert(key, transform(value));
        }
        Ok(())
    }

    fn end(self) -> Result<Value, InvalidValue> {
        Ok(Value::from_map(self.entries, MapType::Bag))
    }
}

struct SerializeStruct {
    name: &'static str,
    fields: ValueMap,
}

impl ser::SerializeStruct for SerializeStruct {
    type Ok = Value;
    type Error = InvalidValue;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), InvalidValue> {
        self.fields.insert(Arc::from(key), transform(value));
        Ok(())
    }

    fn end(self) -> Result<Value, InvalidValue> {
        Ok(Value::from_map(
            self.fields,
            MapType::Record(Arc::from(self.name)),
        ))
    }
}

impl ser::SerializeStructVariant for SerializeStruct {
    type Ok = Value;
    type Error = InvalidValue;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), InvalidValue> {
        ser::SerializeStruct::serialize_field(self, key, value)
    }

    fn end(self) -> Result<Value, InvalidValue> {
        ser::SerializeStruct::end(self)
    }
}
