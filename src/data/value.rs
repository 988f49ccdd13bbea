use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

use indexmap::IndexMap;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// Insertion-ordered map used for JSON objects.
pub type Map = IndexMap<String, DataTree>;

/// A generic tagged value used as the rendering context.
///
/// Built once per request from the JSON body. Values pushed onto the VM
/// argument stack are clones of nodes of this tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DataTree {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<DataTree>),
    Map(Map),
}

impl DataTree {
    /// An empty map, the usual root of a rendering context.
    pub fn empty_map() -> Self {
        DataTree::Map(Map::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DataTree::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataTree::Null | DataTree::Bool(_) | DataTree::Int(_) | DataTree::Float(_)
        )
    }

    /// Get the type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataTree::Null => "null",
            DataTree::Bool(_) => "bool",
            DataTree::Int(_) => "int",
            DataTree::Float(_) => "float",
            DataTree::String(_) => "string",
            DataTree::Array(_) => "array",
            DataTree::Map(_) => "map",
        }
    }

    /// Template truthiness: empty strings and empty containers are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            DataTree::Null => false,
            DataTree::Bool(b) => *b,
            DataTree::Int(n) => *n != 0,
            DataTree::Float(f) => *f != 0.0,
            DataTree::String(s) => !s.is_empty(),
            DataTree::Array(items) => !items.is_empty(),
            DataTree::Map(map) => !map.is_empty(),
        }
    }

    /// Number of elements for containers, characters for strings, 0 otherwise.
    pub fn size(&self) -> usize {
        match self {
            DataTree::String(s) => s.chars().count(),
            DataTree::Array(items) => items.len(),
            DataTree::Map(map) => map.len(),
            DataTree::Null | DataTree::Bool(_) | DataTree::Int(_) | DataTree::Float(_) => 0,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataTree::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            DataTree::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut Map> {
        match self {
            DataTree::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Numeric view of a value. Strings are parsed; containers count as 0.
    pub fn to_number(&self) -> Number {
        match self {
            DataTree::Null => Number::Int(0),
            DataTree::Bool(b) => Number::Int(*b as i64),
            DataTree::Int(n) => Number::Int(*n),
            DataTree::Float(f) => Number::Float(*f),
            DataTree::String(s) => Number::parse(s).unwrap_or(Number::Int(0)),
            DataTree::Array(_) | DataTree::Map(_) => Number::Int(0),
        }
    }

    pub fn to_f64(&self) -> f64 {
        self.to_number().as_f64()
    }

    /// Look up a direct child by key (maps) or decimal index (arrays).
    pub fn child(&self, key: &str) -> Option<&DataTree> {
        match self {
            DataTree::Map(map) => map.get(key),
            DataTree::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    /// Index a container by another value, as the VM's INDEX instruction does.
    pub fn index(&self, key: &DataTree) -> Option<&DataTree> {
        match (self, key) {
            (DataTree::Array(items), DataTree::Int(i)) => {
                usize::try_from(*i).ok().and_then(|i| items.get(i))
            }
            (DataTree::Array(items), DataTree::Float(f)) if f.fract() == 0.0 && *f >= 0.0 => {
                items.get(*f as usize)
            }
            (DataTree::Map(_), _) | (DataTree::Array(_), DataTree::String(_)) => {
                self.child(&key.to_text())
            }
            _ => None,
        }
    }

    /// Resolve a dotted path such as `user.emails.0`.
    pub fn lookup_path(&self, path: &str) -> Option<&DataTree> {
        path.split('.')
            .try_fold(self, |node, segment| node.child(segment))
    }

    /// Textual form used when a value is emitted into the output.
    pub fn to_text(&self) -> Cow<'_, str> {
        match self {
            DataTree::Null => Cow::Borrowed(""),
            DataTree::Bool(true) => Cow::Borrowed("true"),
            DataTree::Bool(false) => Cow::Borrowed("false"),
            DataTree::Int(n) => Cow::Owned(n.to_string()),
            DataTree::Float(f) => Cow::Owned(format_float(*f)),
            DataTree::String(s) => Cow::Borrowed(s),
            DataTree::Array(_) | DataTree::Map(_) => {
                Cow::Owned(serde_json::to_string(self).unwrap_or_default())
            }
        }
    }

    /// Equality with numeric coercion between ints, floats, bools and null.
    pub fn loose_eq(&self, other: &DataTree) -> bool {
        match (self, other) {
            (DataTree::String(a), DataTree::String(b)) => a == b,
            (DataTree::Array(_), _) | (DataTree::Map(_), _) => self == other,
            (_, DataTree::Array(_)) | (_, DataTree::Map(_)) => false,
            (DataTree::String(s), n) | (n, DataTree::String(s)) => match Number::parse(s) {
                Some(parsed) => parsed.as_f64() == n.to_f64(),
                None => false,
            },
            (a, b) => a.to_number() == b.to_number(),
        }
    }

    /// Ordering used by the comparison instructions.
    pub fn compare(&self, other: &DataTree) -> Ordering {
        match (self, other) {
            (DataTree::String(a), DataTree::String(b)) => a.cmp(b),
            (a, b) => a
                .to_f64()
                .partial_cmp(&b.to_f64())
                .unwrap_or(Ordering::Equal),
        }
    }
}

/// Format a float the way templates print it: integral values drop the
/// fractional part.
pub fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

/// A numeric operand produced by coercion.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    /// Parse a decimal integer or float literal, ignoring surrounding spaces.
    pub fn parse(s: &str) -> Option<Number> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Ok(n) = s.parse::<i64>() {
            return Some(Number::Int(n));
        }
        s.parse::<f64>().ok().map(Number::Float)
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Float(f) => f,
        }
    }

    pub fn into_tree(self) -> DataTree {
        match self {
            Number::Int(n) => DataTree::Int(n),
            Number::Float(f) => DataTree::Float(f),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            _ => self.as_f64() == other.as_f64(),
        }
    }
}

impl fmt::Display for DataTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl Serialize for DataTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DataTree::Null => serializer.serialize_unit(),
            DataTree::Bool(b) => serializer.serialize_bool(*b),
            DataTree::Int(n) => serializer.serialize_i64(*n),
            DataTree::Float(f) => serializer.serialize_f64(*f),
            DataTree::String(s) => serializer.serialize_str(s),
            DataTree::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            DataTree::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for DataTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(DataTreeVisitor)
    }
}

struct DataTreeVisitor;

impl<'de> Visitor<'de> for DataTreeVisitor {
    type Value = DataTree;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<DataTree, E> {
        Ok(DataTree::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<DataTree, E> {
        Ok(DataTree::Null)
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> Result<DataTree, E> {
        Ok(DataTree::Bool(b))
    }

    fn visit_i64<E: de::Error>(self, n: i64) -> Result<DataTree, E> {
        Ok(DataTree::Int(n))
    }

    fn visit_u64<E: de::Error>(self, n: u64) -> Result<DataTree, E> {
        Ok(match i64::try_from(n) {
            Ok(n) => DataTree::Int(n),
            Err(_) => DataTree::Float(n as f64),
        })
    }

    fn visit_f64<E: de::Error>(self, f: f64) -> Result<DataTree, E> {
        if !f.is_finite() {
            return Err(E::custom("number out of range"));
        }
        Ok(DataTree::Float(f))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<DataTree, E> {
        Ok(DataTree::String(s.to_owned()))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<DataTree, E> {
        Ok(DataTree::String(s))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<DataTree, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(DataTree::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<DataTree, A::Error> {
        let mut map = Map::with_capacity(access.size_hint().unwrap_or(0));
        // Last write wins; the key keeps its first position.
        while let Some((key, value)) = access.next_entry::<String, DataTree>()? {
            map.insert(key, value);
        }
        Ok(DataTree::Map(map))
    }
}

impl From<bool> for DataTree {
    fn from(b: bool) -> Self {
        DataTree::Bool(b)
    }
}

impl From<i64> for DataTree {
    fn from(n: i64) -> Self {
        DataTree::Int(n)
    }
}

impl From<f64> for DataTree {
    fn from(f: f64) -> Self {
        DataTree::Float(f)
    }
}

impl From<&str> for DataTree {
    fn from(s: &str) -> Self {
        DataTree::String(s.to_string())
    }
}

impl From<String> for DataTree {
    fn from(s: String) -> Self {
        DataTree::String(s)
    }
}

impl From<Vec<DataTree>> for DataTree {
    fn from(items: Vec<DataTree>) -> Self {
        DataTree::Array(items)
    }
}

impl From<Map> for DataTree {
    fn from(map: Map) -> Self {
        DataTree::Map(map)
    }
}
