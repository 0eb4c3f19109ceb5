use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValuesError {
    #[error("values must be a mapping, got {0}")]
    NotAMapping(&'static str),

    #[error("{path} is {found}, expected {expected}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Helm values: an arbitrary tree addressed with dotted paths such as `global.istioNamespace`.
///
/// Accessors fail with [`ValuesError::TypeMismatch`] when a value exists but has the wrong type,
/// and return `None` when it is missing or null.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(Map<String, Value>);

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values from the untyped `spec.values` of an IstioRevision; absent and null are empty.
    pub fn from_value(value: Option<&Value>) -> Result<Self, ValuesError> {
        match value {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::Object(map)) => Ok(Self(map.clone())),
            Some(other) => Err(ValuesError::NotAMapping(type_name(other))),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Look up a dotted path. Walking through anything other than a mapping is an error.
    pub fn get(&self, path: &str) -> Result<Option<&Value>, ValuesError> {
        let mut current = &self.0;
        let mut segments = path.split('.').peekable();
        let mut walked = String::new();
        while let Some(segment) = segments.next() {
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(segment);

            let Some(value) = current.get(segment) else {
                return Ok(None);
            };
            if segments.peek().is_none() {
                return Ok(match value {
                    Value::Null => None,
                    value => Some(value),
                });
            }
            match value {
                Value::Object(map) => current = map,
                Value::Null => return Ok(None),
                other => {
                    return Err(ValuesError::TypeMismatch {
                        path: walked,
                        expected: "a mapping",
                        found: type_name(other),
                    })
                }
            }
        }
        Ok(None)
    }

    pub fn get_bool(&self, path: &str) -> Result<Option<bool>, ValuesError> {
        match self.get(path)? {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(ValuesError::TypeMismatch {
                path: path.into(),
                expected: "a bool",
                found: type_name(other),
            }),
        }
    }

    pub fn get_str(&self, path: &str) -> Result<Option<&str>, ValuesError> {
        match self.get(path)? {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(ValuesError::TypeMismatch {
                path: path.into(),
                expected: "a string",
                found: type_name(other),
            }),
        }
    }

    /// Set a dotted path, creating intermediate mappings. Null intermediates are replaced.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<(), ValuesError> {
        let mut current = &mut self.0;
        let mut segments: Vec<&str> = path.split('.').collect();
        let Some(leaf) = segments.pop() else {
            return Ok(());
        };

        let mut walked = String::new();
        for segment in segments {
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(segment);

            let entry = current
                .entry(segment)
                .or_insert_with(|| Value::Object(Map::new()));
            if entry.is_null() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                other => {
                    return Err(ValuesError::TypeMismatch {
                        path: walked,
                        expected: "a mapping",
                        found: type_name(other),
                    })
                }
            };
        }
        current.insert(leaf.to_string(), value.into());
        Ok(())
    }
}
