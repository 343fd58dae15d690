//! The value model as it travels between host and worker.
use std::error::Error as _;
use std::fmt;
use std::sync::Arc;

use minirazor::value::{MapType, Value, ValueKind, ValueMap};
use minirazor::{Diagnostic, Error, ErrorKind};
use serde::{Deserialize, Serialize};

/// A [`Value`] in a form that can be sent to the worker.
///
/// Maps keep their entry order and whether they were records (with their
/// type name) or bags, so typed models are still checked against
/// `@model` on the other side.  Safe strings stay safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum WireValue {
    /// None, also used for missing values.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer, also used for floats without a fractional part.
    Int(i64),
    /// A float.
    Float(f64),
    /// A string that is encoded when emitted.
    Str(String),
    /// A string that is emitted without encoding.
    Safe(String),
    /// A sequence.
    Seq(Vec<WireValue>),
    /// An anonymous map.
    Bag(Vec<(String, WireValue)>),
    /// A typed map.
    Record {
        /// The record's type name.
        name: String,
        /// The fields in order.
        fields: Vec<(String, WireValue)>,
    },
}

impl WireValue {
    /// Converts a value for the wire.
    ///
    /// Values that failed to convert into the value model are rejected
    /// here, before anything is sent.
    pub fn from_value(value: &Value) -> Result<WireValue, Error> {
        Ok(match value.kind() {
            ValueKind::None | ValueKind::Missing => WireValue::Null,
            ValueKind::Bool => WireValue::Bool(value.is_true()),
            ValueKind::Number => match value.as_i64() {
                Some(val) => WireValue::Int(val),
                None => WireValue::Float(value.as_f64().unwrap_or(f64::NAN)),
            },
            ValueKind::String => {
                let s = value.as_str().unwrap_or_default().to_string();
                if value.is_safe() {
                    WireValue::Safe(s)
                } else {
                    WireValue::Str(s)
                }
            }
            ValueKind::Seq => WireValue::Seq(
                value
                    .as_slice()
                    .unwrap_or_default()
                    .iter()
                    .map(WireValue::from_value)
                    .collect::<Result<_, _>>()?,
            ),
            ValueKind::Map => {
                let fields = match value.as_map() {
                    Some(map) => map
                        .iter()
                        .map(|(k, v)| Ok((k.to_string(), WireValue::from_value(v)?)))
                        .collect::<Result<Vec<_>, Error>>()?,
                    None => Vec::new(),
                };
                match value.map_type() {
                    Some(MapType::Record(name)) => WireValue::Record {
                        name: name.to_string(),
                        fields,
                    },
                    _ => WireValue::Bag(fields),
                }
            }
            _ => {
                // surfaces the conversion failure with its message
                value.validate()?;
                return Err(Error::new(
                    ErrorKind::BadSerialization,
                    format!("cannot send {} to the worker", value.kind()),
                ));
            }
        })
    }

    /// Converts the wire form back into a value.
    pub fn into_value(self) -> Value {
        match self {
            WireValue::Null => Value::NONE,
            WireValue::Bool(val) => Value::from(val),
            WireValue::Int(val) => Value::from(val),
            WireValue::Float(val) => Value::from(val),
            WireValue::Str(val) => Value::from(val),
            WireValue::Safe(val) => Value::from_safe_string(val),
            WireValue::Seq(items) => items.into_iter().map(WireValue::into_value).collect(),
            WireValue::Bag(fields) => Value::from_map(into_map(fields), MapType::Bag),
            WireValue::Record { name, fields } => {
                Value::from_map(into_map(fields), MapType::Record(Arc::from(name)))
            }
        }
    }
}

fn into_map(fields: Vec<(String, WireValue)>) -> ValueMap {
    fields
        .into_iter()
        .map(|(k, v)| (Arc::from(k), v.into_value()))
        .collect()
}

/// An [`Error`] as reported by the worker.
///
/// Everything that is needed to locate the fault is kept: kind, detail,
/// location, diagnostics, program text and template source.  The source
/// error chain is flattened into a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    /// The kind of the error.
    pub kind: ErrorKind,
    /// The detail message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The template the error happened in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The line the error happened on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    /// Generator and backend diagnostics.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
    /// The generated program text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_text: Option<String>,
    /// The template source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_source: Option<String>,
    /// The flattened source error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl WireError {
    /// Captures an engine error for the wire.
    pub fn from_error(err: &Error) -> WireError {
        let mut cause = None;
        let mut source = err.source();
        while let Some(err) = source {
            let msg = err.to_string();
            cause = Some(match cause {
                None => msg,
                Some(prev) => format!("{}: {}", prev, msg),
            });
            source = err.source();
        }
        WireError {
            kind: err.kind(),
            detail: err.detail().map(str::to_string),
            name: err.name().map(str::to_string),
            line: err.line(),
            diagnostics: err.diagnostics().to_vec(),
            program_text: err.program_text().map(str::to_string),
            template_source: err.template_source().map(str::to_string),
            cause,
        }
    }

    /// Rebuilds the engine error.
    pub fn into_error(self) -> Error {
        let mut rv = match self.detail {
            Some(detail) => Error::new(self.kind, detail),
            None => Error::from(self.kind),
        };
        if let Some(ref name) = self.name {
            rv = rv.with_location(name, self.line.unwrap_or(0));
        }
        if !self.diagnostics.is_empty() {
            rv = rv.with_diagnostics(self.diagnostics);
        }
        if let Some(text) = self.program_text {
            rv = rv.with_program_text(Arc::from(text));
        }
        if let Some(source) = self.template_source {
            rv = rv.with_template_source(Arc::from(source));
        }
        if let Some(cause) = self.cause {
            rv = rv.with_source(RemoteCause(cause));
        }
        rv
    }
}

/// The flattened source chain of an error raised in the worker.
#[derive(Debug)]
pub struct RemoteCause(String);

impl fmt::Display for RemoteCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for RemoteCause {}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    #[derive(Serialize)]
    struct Person {
        name: &'static str,
        tags: Vec<&'static str>,
    }

    #[test]
    fn test_record_survives() {
        let value = Value::from_serialize(&Person {
            name: "Ada",
            tags: vec!["x"],
        });
        let wire = WireValue::from_value(&value).unwrap();
        let json = serde_json::to_string(&wire).unwrap();
        insta::assert_snapshot!(json, @r###"{"t":"record","v":{"name":"Person","fields":[["name",{"t":"str","v":"Ada"}],["tags",{"t":"seq","v":[{"t":"str","v":"x"}]}]]}}"###);
        let back: WireValue = serde_json::from_str(&json).unwrap();
        let value2 = back.into_value();
        assert_eq!(value2.type_name(), Some("Person"));
        assert_eq!(value2, value);
    }

    #[test]
    fn test_safe_strings_and_bags() {
        let value = Value::from_bag([("html", Value::from_safe_string("<b>".into()))]);
        let back = WireValue::from_value(&value).unwrap().into_value();
        assert_eq!(back.map_type(), Some(&MapType::Bag));
        assert!(back.get_attr("html").unwrap().is_safe());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        struct Handle;

        impl Serialize for Handle {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("handles cannot be serialized"))
            }
        }

        let value = Value::from_serialize(&vec![Handle]);
        let err = WireValue::from_value(&value).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadSerialization);
        assert_eq!(err.detail(), Some("handles cannot be serialized"));
    }

    #[test]
    fn test_error_round_trip_keeps_context() {
        let err = Error::new(ErrorKind::UndefinedError, "no property \"x\"")
            .with_location("page", 3)
            .with_template_source(Arc::from("a\nb\n@Model.x"));
        let wire = WireError::from_error(&err);
        let back = wire.into_error();
        assert_eq!(back.kind(), ErrorKind::UndefinedError);
        assert_eq!(back.to_string(), err.to_string());
        assert_eq!(back.line(), Some(3));
        assert_eq!(back.template_source(), Some("a\nb\n@Model.x"));
    }
}
