use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The type of a single element of a cached value, as seen by the shared cache codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    String,
    Integer,
    Float,
    Boolean,
    /// Any JSON value, typically a struct. Not validated.
    #[default]
    Any,
}

impl ElementType {
    /// Whether the encoded `value` is a valid element of this type.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Any => true,
        }
    }

    /// Whether `key` is a valid map key of this type.
    ///
    /// Encoded maps always have string keys, so non-string key types have to be parsed back.
    pub fn matches_key(self, key: &str) -> bool {
        match self {
            Self::String | Self::Any => true,
            Self::Integer => key.parse::<i64>().is_ok() || key.parse::<u64>().is_ok(),
            Self::Float => key.parse::<f64>().is_ok(),
            Self::Boolean => key == "true" || key == "false",
        }
    }
}

impl AsRef<str> for ElementType {
    fn as_ref(&self) -> &str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Any => "any",
        }
    }
}

/// The structural category of a computation's return value.
///
/// The shape has to be declared since the element types of a generic return value cannot be
/// recovered from an encoded value. It drives how the shared cache encodes and validates
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    /// A plain value.
    Scalar(ElementType),
    /// An optional value. Absent values are never cached.
    Optional(ElementType),
    /// An ordered list of elements.
    List(ElementType),
    /// A map, with both key and value types.
    Map { key: ElementType, value: ElementType },
}

impl Default for Shape {
    fn default() -> Self {
        Self::Scalar(ElementType::Any)
    }
}

impl Shape {
    /// The name of the shape's category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Optional(_) => "optional",
            Self::List(_) => "list",
            Self::Map { .. } => "map",
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(ty) => write!(f, "{}", ty.as_ref()),
            Self::Optional(ty) => write!(f, "optional<{}>", ty.as_ref()),
            Self::List(ty) => write!(f, "list<{}>", ty.as_ref()),
            Self::Map { key, value } => write!(f, "map<{}, {}>", key.as_ref(), value.as_ref()),
        }
    }
}

/// Identifies one cacheable computation and its cache configuration.
///
/// Descriptors are declared once at startup, either in code or through the `caches` list of
/// the [`Config`](crate::Config), and are immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDescriptor {
    /// Unique name, conventionally `Owner.computation`.
    pub name: String,

    /// Time after which an entry is no longer valid, regardless of capacity.
    ///
    /// Defaults to `2h`.
    #[serde(with = "humantime_serde", default = "default_ttl")]
    pub ttl: Duration,

    /// Maximum number of simultaneously held entries.
    ///
    /// Defaults to `1000`.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Number of arguments the computation takes.
    #[serde(default)]
    pub arity: usize,

    /// Re-run the computation in the background whenever its entry is evicted.
    ///
    /// Only valid for computations without arguments.
    #[serde(default)]
    pub auto_reload: bool,

    /// Mirror entries into the shared cache.
    #[serde(default)]
    pub distributed: bool,

    /// The shape of the computation's return value.
    #[serde(default)]
    pub shape: Shape,
}

fn default_ttl() -> Duration {
    Duration::from_secs(120 * 60)
}

fn default_capacity() -> usize {
    1000
}

impl CacheDescriptor {
    /// Creates a descriptor with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl: default_ttl(),
            capacity: default_capacity(),
            arity: 0,
            auto_reload: false,
            distributed: false,
            shape: Shape::default(),
        }
    }

    /// Creates a descriptor named after the owning type and the computation.
    pub fn for_method(owner: &str, computation: &str) -> Self {
        Self::new(format!("{owner}.{computation}"))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = arity;
        self
    }

    pub fn with_auto_reload(mut self) -> Self {
        self.auto_reload = true;
        self
    }

    pub fn with_shape(mut self, shape: Shape) -> Self {
        self.shape = shape;
        self
    }

    /// Marks the descriptor as distributed, with the given return shape.
    pub fn distributed(mut self, shape: Shape) -> Self {
        self.distributed = true;
        self.shape = shape;
        self
    }
}
