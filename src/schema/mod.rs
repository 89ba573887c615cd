//! Primitive schema layer.
//!
//! The streams themselves only depend on the [`ValueCodec`] and
//! [`SchemaLoader`] seams, so a full record/union schema implementation can
//! be plugged in from outside.  This module supplies the built-in default:
//! the eight Avro primitive types, parsed from schema JSON (either a bare
//! name such as `"long"` or an object `{"type": "long"}`).

use thiserror::Error;

use crate::tap::Tap;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("invalid schema: {0}")]
    Invalid(String),
    #[error("schema is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Raised when a value handed to an encoder does not match its schema.
/// Non-fatal: the stream stays usable for subsequent values.
#[derive(Error, Debug)]
#[error("value does not match {schema:?} schema")]
pub struct ValueError {
    pub schema: Type,
}

/// Writes, reads and skips values of one schema through a [`Tap`].
///
/// `read` and `skip` may leave the tap invalid on underflow; callers follow
/// the save/check/restore discipline.  `write` reports a value/schema
/// mismatch through its result and buffer overflow through tap validity —
/// two distinct channels, handled by two distinct recovery paths.
pub trait ValueCodec {
    type Value;

    fn write(&self, tap: &mut Tap, value: &Self::Value) -> Result<(), ValueError>;
    fn read(&self, tap: &mut Tap) -> Self::Value;
    fn skip(&self, tap: &mut Tap);
}

/// Builds a [`ValueCodec`] from the schema text found in a container
/// header.  Loader instances carry their own parse options.
pub trait SchemaLoader {
    type Codec: ValueCodec;

    fn load(&self, schema_json: &[u8]) -> Result<Self::Codec, SchemaError>;
}

/// The built-in loader for primitive schemas.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrimitiveLoader;

impl SchemaLoader for PrimitiveLoader {
    type Codec = Type;

    fn load(&self, schema_json: &[u8]) -> Result<Type, SchemaError> {
        Type::parse(schema_json)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    String,
}

impl Type {
    pub fn from_name(name: &str) -> Result<Self, SchemaError> {
        match name {
            "null" => Ok(Type::Null),
            "boolean" => Ok(Type::Boolean),
            "int" => Ok(Type::Int),
            "long" => Ok(Type::Long),
            "float" => Ok(Type::Float),
            "double" => Ok(Type::Double),
            "bytes" => Ok(Type::Bytes),
            "string" => Ok(Type::String),
            other => Err(SchemaError::Invalid(format!("unknown type name: {other}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Type::Null => "null",
            Type::Boolean => "boolean",
            Type::Int => "int",
            Type::Long => "long",
            Type::Float => "float",
            Type::Double => "double",
            Type::Bytes => "bytes",
            Type::String => "string",
        }
    }

    /// The schema text written into the `avro.schema` header entry.
    pub fn canonical_json(&self) -> String {
        format!("\"{}\"", self.name())
    }

    /// Parse schema JSON: a quoted name or an object carrying `"type"`.
    pub fn parse(text: &[u8]) -> Result<Self, SchemaError> {
        let json: serde_json::Value = serde_json::from_slice(text)?;
        Self::from_json(&json)
    }

    fn from_json(json: &serde_json::Value) -> Result<Self, SchemaError> {
        match json {
            serde_json::Value::String(name) => Self::from_name(name),
            serde_json::Value::Object(fields) => match fields.get("type") {
                Some(inner) => Self::from_json(inner),
                None => Err(SchemaError::Invalid("object schema without \"type\"".into())),
            },
            other => Err(SchemaError::Invalid(format!("unsupported schema: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    String(String),
}

impl ValueCodec for Type {
    type Value = Value;

    fn write(&self, tap: &mut Tap, value: &Value) -> Result<(), ValueError> {
        match (self, value) {
            (Type::Null, Value::Null) => {}
            (Type::Boolean, Value::Boolean(v)) => tap.write_boolean(*v),
            (Type::Int, Value::Int(v)) => tap.write_long(i64::from(*v)),
            (Type::Long, Value::Long(v)) => tap.write_long(*v),
            (Type::Float, Value::Float(v)) => tap.write_float(*v),
            (Type::Double, Value::Double(v)) => tap.write_double(*v),
            (Type::Bytes, Value::Bytes(v)) => tap.write_bytes(v),
            (Type::String, Value::String(v)) => tap.write_string(v),
            _ => return Err(ValueError { schema: *self }),
        }
        Ok(())
    }

    fn read(&self, tap: &mut Tap) -> Value {
        match self {
            Type::Null => Value::Null,
            Type::Boolean => Value::Boolean(tap.read_boolean()),
            Type::Int => Value::Int(tap.read_long() as i32),
            Type::Long => Value::Long(tap.read_long()),
            Type::Float => Value::Float(tap.read_float()),
            Type::Double => Value::Double(tap.read_double()),
            Type::Bytes => Value::Bytes(tap.read_bytes()),
            Type::String => Value::String(tap.read_string()),
        }
    }

    fn skip(&self, tap: &mut Tap) {
        match self {
            Type::Null => {}
            Type::Boolean => tap.skip_boolean(),
            Type::Int | Type::Long => tap.skip_long(),
            Type::Float => tap.skip_float(),
            Type::Double => tap.skip_double(),
            Type::Bytes => tap.skip_bytes(),
            Type::String => tap.skip_string(),
        }
    }
}
