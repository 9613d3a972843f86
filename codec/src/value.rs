use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

/// Key of a packet map. The wire format allows string and integer keys;
/// nothing else.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapKey {
    Str(String),
    Int(i64),
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Str(s) => write!(f, "{s}"),
            MapKey::Int(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for MapKey {
    fn from(s: &str) -> Self {
        MapKey::Str(s.to_owned())
    }
}

impl From<i64> for MapKey {
    fn from(i: i64) -> Self {
        MapKey::Int(i)
    }
}

/// One element of a packet tuple.
///
/// Floats are deliberately absent: fractional quantities travel as scaled
/// integers or strings. `Chunked` is the placeholder left in a main chunk
/// for a large binary argument shipped as an auxiliary chunk; it never
/// survives reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Bytes(Bytes),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<MapKey, Value>),
    Chunked { index: u8, len: u32 },
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|i| u64::try_from(i).ok())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Byte-string access, tolerating peers that send text where bytes are
    /// expected.
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            Value::Bytes(b) => Some(b.clone()),
            Value::Str(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<MapKey, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Chunked { .. } => "chunked",
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Value::Int(i as i64)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<BTreeMap<MapKey, Value>> for Value {
    fn from(m: BTreeMap<MapKey, Value>) -> Self {
        Value::Map(m)
    }
}

/// Builder shorthand for capability maps.
#[macro_export]
macro_rules! vmap {
    ($($k:expr => $v:expr),* $(,)?) => {{
        let mut m = std::collections::BTreeMap::new();
        $(m.insert($crate::MapKey::from($k), $crate::Value::from($v));)*
        $crate::Value::Map(m)
    }};
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_accessor_coercions() {
        assert_eq!(Value::Bool(true).as_i64(), Some(1));
        assert_eq!(Value::Int(0).as_bool(), Some(false));
        assert_eq!(Value::Str("abc".into()).as_bytes().unwrap().as_ref(), b"abc");
        assert_eq!(Value::Int(-1).as_u64(), None);
    }

    #[test]
    fn test_vmap_macro() {
        let v = vmap! {"version" => "6.0", 3 => true};
        let m = v.as_map().unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m[&MapKey::from("version")].as_str(), Some("6.0"));
        assert_eq!(m[&MapKey::from(3)].as_bool(), Some(true));
    }
}
