use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Task parameters: a string-keyed JSON mapping whose keys must be unique.
///
/// `serde_json::Map` silently keeps the last of two duplicate keys, so
/// deserialization goes through a visitor that rejects them instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters(BTreeMap<String, serde_json::Value>);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParameterError {
    #[error("parameters must be a JSON object")]
    NotAnObject,
    #[error("duplicate parameter key '{0}'")]
    DuplicateKey(String),
    #[error("parameter keys must not be empty")]
    EmptyKey,
    #[error("malformed parameters JSON: {0}")]
    Malformed(String),
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<(), ParameterError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ParameterError::EmptyKey);
        }
        if self.0.contains_key(&key) {
            return Err(ParameterError::DuplicateKey(key));
        }
        self.0.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses a raw JSON object. Entries are read in document order and
    /// checked by `insert`, so duplicate and empty keys come back typed.
    pub fn from_json_str(raw: &str) -> Result<Self, ParameterError> {
        let RawEntries(entries) = serde_json::from_str(raw).map_err(|e| match e.classify() {
            serde_json::error::Category::Data => ParameterError::NotAnObject,
            _ => ParameterError::Malformed(e.to_string()),
        })?;
        let mut params = Parameters::new();
        for (key, value) in entries {
            params.insert(key, value)?;
        }
        Ok(params)
    }

    /// Flat string form used for process environments and logs.
    pub fn as_env_pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// Every entry of a JSON object, duplicates included.
struct RawEntries(Vec<(String, serde_json::Value)>);

impl<'de> serde::Deserialize<'de> for RawEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = RawEntries;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = access.next_entry::<String, serde_json::Value>()? {
                    entries.push(entry);
                }
                Ok(RawEntries(entries))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(RawEntries(Vec::new()))
            }
        }

        deserializer.deserialize_any(EntriesVisitor)
    }
}

impl serde::Serialize for Parameters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> serde::Deserialize<'de> for Parameters {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ParametersVisitor;

        impl<'de> Visitor<'de> for ParametersVisitor {
            type Value = Parameters;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object with unique keys")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut params = Parameters::new();
                while let Some((key, value)) = access.next_entry::<String, serde_json::Value>()? {
                    params
                        .insert(key, value)
                        .map_err(de::Error::custom)?;
                }
                Ok(params)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(Parameters::new())
            }
        }

        deserializer.deserialize_any(ParametersVisitor)
    }
}
