// `ok!` and `some!` are less bloaty alternatives to the standard library's try operator (`?`).
// They are used in the hot paths of the VM where no error conversion is needed.

macro_rules! ok {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(err) => return Err(err),
        }
    };
}

macro_rules! some {
    ($expr:expr) => {
        match $expr {
            Some(val) => val,
            None => return None,
        }
    };
}

/// Hidden utility module for the [`model!`](crate::model!) macro.
#[doc(hidden)]
pub mod __model {
    use crate::value::{MapType, Value, ValueMap};

    #[inline(always)]
    pub fn make() -> ValueMap {
        ValueMap::default()
    }

    #[inline(always)]
    pub fn add(model: &mut ValueMap, key: &'static str, value: Value) {
        model.insert(key.into(), value);
    }

    #[inline(always)]
    pub fn build(model: ValueMap) -> Value {
        Value::from_map(model, MapType::Bag)
    }
}

/// Creates an anonymous (bag style) model from keys and values.
///
/// ```rust
/// # use minirazor::model;
/// let model = model! {
///     name => "Peter",
///     location => "World",
/// };
/// ```
///
/// Alternatively if the variable name matches the key name it can
/// be omitted:
///
/// ```rust
/// # use minirazor::model;
/// let name = "Peter";
/// let model = model! { name };
/// ```
///
/// Models created this way behave like anonymous objects: when the engine
/// is configured to tolerate missing properties, looking up an attribute
/// that does not exist yields an empty value instead of failing.  Values
/// are converted with [`Value::from_serialize`](crate::value::Value::from_serialize),
/// so nested structs keep their record type.
#[macro_export]
macro_rules! model {
    () => {
        $crate::__model::build($crate::__model::make())
    };
    (
        $($key:ident $(=> $value:expr)?),* $(,)?
    ) => {{
        let mut model = $crate::__model::make();
        $(
            $crate::__model_pair!(model, $key $(=> $value)?);
        )*
        $crate::__model::build(model)
    }};
}

#[macro_export]
#[doc(hidden)]
macro_rules! __model_pair {
    ($model:ident, $key:ident) => {{
        $crate::__model_pair!($model, $key => $key);
    }};
    ($model:ident, $key:ident => $value:expr) => {
        $crate::__model::add(
            &mut $model,
            stringify!($key),
            $crate::value::Value::from_serialize(&$value),
        );
    };
}
