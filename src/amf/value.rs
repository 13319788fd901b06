//! AMF value types
//!
//! Objects are kept as ordered key/value lists rather than maps: some
//! servers are sensitive to the property order of the `connect` command
//! object, so the order a caller builds is the order put on the wire.

/// Ordered list of object properties
pub type AmfProperties = Vec<(String, AmfValue)>;

/// AMF0 value representation
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    /// IEEE 754 double-precision floating point (0x00)
    Number(f64),

    /// Boolean value (0x01)
    Boolean(bool),

    /// UTF-8 string (0x02, or 0x0C when longer than 0xFFFF bytes)
    String(String),

    /// Anonymous object with ordered properties (0x03)
    Object(AmfProperties),

    /// Null value (0x05)
    Null,

    /// Undefined value (0x06)
    Undefined,

    /// Associative array (0x08), decoded from server replies
    EcmaArray(AmfProperties),

    /// Dense array (0x0A)
    Array(Vec<AmfValue>),
}

impl AmfValue {
    /// Build an object from `(key, value)` pairs, keeping their order
    pub fn object<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<AmfValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        AmfValue::Object(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Try to get this value as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Try to get this value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get the properties of an object or ECMA array
    pub fn as_object(&self) -> Option<&[(String, AmfValue)]> {
        match self {
            AmfValue::Object(props) | AmfValue::EcmaArray(props) => Some(props),
            _ => None,
        }
    }

    /// Get a property from an object value (first match wins)
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Get a string property from an object value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Get a number property from an object value
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }
}

impl Default for AmfValue {
    fn default() -> Self {
        AmfValue::Null
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

// AMF0 has no integer type: every numeric is promoted to a double.
macro_rules! impl_from_numeric {
    ($($t:ty),*) => {
        $(
            impl From<$t> for AmfValue {
                fn from(v: $t) -> Self {
                    AmfValue::Number(v as f64)
                }
            }
        )*
    };
}

impl_from_numeric!(f64, f32, i8, i16, i32, i64, u8, u16, u32, u64, isize, usize);

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

impl<V: Into<AmfValue>> From<Vec<V>> for AmfValue {
    fn from(v: Vec<V>) -> Self {
        AmfValue::Array(v.into_iter().map(|x| x.into()).collect())
    }
}
