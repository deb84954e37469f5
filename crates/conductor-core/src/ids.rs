use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Identifier of a remote agent run (or an orchestrator, which is a run with children).
///
/// The remote service hands out numeric ids, but callers pass them around as both
/// integers and strings. Every constructor normalizes to one canonical string so
/// `123` and `"123"` key the same entry.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct RunId(String);

impl RunId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(normalize(raw.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Numeric form of the id, if the remote assigned an integer id.
    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    // "00123" and "123" are the same numeric run
    match trimmed.parse::<u64>() {
        Ok(n) => n.to_string(),
        Err(_) => trimmed.to_owned(),
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&String> for RunId {
    fn from(s: &String) -> Self {
        Self::new(s)
    }
}

impl From<&RunId> for RunId {
    fn from(id: &RunId) -> Self {
        id.clone()
    }
}

macro_rules! from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for RunId {
                fn from(n: $t) -> Self {
                    Self(n.to_string())
                }
            }
        )*
    };
}

from_integer!(u32, u64, i32, i64, usize);

impl Serialize for RunId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

struct RunIdVisitor;

impl<'de> Visitor<'de> for RunIdVisitor {
    type Value = RunId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a run id as a string or integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<RunId, E> {
        Ok(RunId::new(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<RunId, E> {
        Ok(RunId::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<RunId, E> {
        Ok(RunId::from(v))
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(RunIdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_and_string_forms_are_equal() {
        assert_eq!(RunId::from(123u64), RunId::from("123"));
        assert_eq!(RunId::from(456i64), RunId::new(" 456 "));
    }

    #[test]
    fn leading_zeros_normalize() {
        assert_eq!(RunId::new("0042").as_str(), "42");
    }

    #[test]
    fn non_numeric_ids_are_kept() {
        let id = RunId::new("  run-abc ");
        assert_eq!(id.as_str(), "run-abc");
        assert_eq!(id.as_u64(), None);
    }

    #[test]
    fn deserializes_from_number_or_string() {
        let a: RunId = serde_json::from_str("789").unwrap();
        let b: RunId = serde_json::from_str("\"789\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"789\"");
    }

    #[test]
    fn usable_as_map_key_after_roundtrip() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(RunId::from(7u64), "seven");
        let json = serde_json::to_string(&map).unwrap();
        let parsed: std::collections::BTreeMap<RunId, String> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.get(&RunId::from("7")).map(String::as_str), Some("seven"));
    }
}
