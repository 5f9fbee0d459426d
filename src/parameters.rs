//! Typed parameter tree loaded from TOML.
//!
//! Every leaf is an inline table with a `val` and a `type`:
//!
//! ```toml
//! [ekf.mag]
//! declination_deg = { val = 2.5, type = "float" }
//! ```
//!
//! Nested tables become dotted paths (`ekf.mag.declination_deg`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toml::{Table, Value};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Error deserializing parameters")]
    Deserialize(#[from] toml::de::Error),

    #[error("Error serializing parameters")]
    Serialize(#[from] toml::ser::Error),

    #[error("Parameter toml does not have the right structure (error in '{0}')")]
    BadToml(String),

    #[error("Element '{path}' not found")]
    NotFound { path: String },

    #[error("Cannot cast parameter '{path}' to {dtype}")]
    BadCast { path: String, dtype: String },

    #[error("Element '{path}' is not a parameter")]
    NotAParameter { path: String },

    #[error("Element '{path}' is not a map")]
    NotAMap { path: String },
}

/// Value kinds the navigation filter tuning is expressed in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ParameterValue {
    #[serde(rename = "bool")]
    Bool { val: bool },
    #[serde(rename = "int")]
    Int { val: i64 },
    #[serde(rename = "float")]
    Float { val: f64 },
    /// Body frame offsets and other vectors
    #[serde(rename = "float[]")]
    FloatArray { val: Vec<f64> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    path: String,
    value: ParameterValue,
}

impl Parameter {
    pub fn path(&self) -> &str {
        &self.path
    }

    fn bad_cast(&self, dtype: &str) -> Error {
        Error::BadCast {
            path: self.path.clone(),
            dtype: dtype.to_string(),
        }
    }

    pub fn value_bool(&self) -> Result<bool, Error> {
        match self.value {
            ParameterValue::Bool { val } => Ok(val),
            _ => Err(self.bad_cast("bool")),
        }
    }

    pub fn value_int(&self) -> Result<i64, Error> {
        match self.value {
            ParameterValue::Int { val } => Ok(val),
            _ => Err(self.bad_cast("int")),
        }
    }

    pub fn value_float(&self) -> Result<f64, Error> {
        match self.value {
            ParameterValue::Float { val } => Ok(val),
            _ => Err(self.bad_cast("float")),
        }
    }

    pub fn value_float_arr(&self) -> Result<&[f64], Error> {
        match &self.value {
            ParameterValue::FloatArray { val } => Ok(val),
            _ => Err(self.bad_cast("float[]")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterMap {
    path: String,
    map: BTreeMap<String, ParameterTree>,
}

impl ParameterMap {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn get(&self, rel_path: &str) -> Result<&ParameterTree, Error> {
        let not_found = || Error::NotFound {
            path: append_path(&self.path, rel_path),
        };

        let mut parts = rel_path.split('.');
        let first = parts.next().ok_or_else(not_found)?;
        let mut elem = self.map.get(first).ok_or_else(not_found)?;

        for part in parts {
            match elem {
                ParameterTree::Node(n) => {
                    elem = n.map.get(part).ok_or_else(not_found)?;
                }
                ParameterTree::Leaf(_) => return Err(not_found()),
            }
        }

        Ok(elem)
    }

    pub fn get_param(&self, rel_path: &str) -> Result<&Parameter, Error> {
        self.get(rel_path)?.as_param()
    }

    pub fn get_map(&self, rel_path: &str) -> Result<&ParameterMap, Error> {
        self.get(rel_path)?.as_map()
    }

    /// Writes a float leaf, creating it and any missing parent maps.
    pub fn set_float(&mut self, rel_path: &str, val: f64) -> Result<(), Error> {
        let (parents, key) = match rel_path.rsplit_once('.') {
            Some((parents, key)) => (Some(parents), key),
            None => (None, rel_path),
        };

        let mut map = self;
        for part in parents.into_iter().flat_map(|p| p.split('.')) {
            let child_path = append_path(&map.path, part);
            let child = map.map.entry(part.to_string()).or_insert_with(|| {
                ParameterTree::Node(ParameterMap {
                    path: child_path,
                    map: BTreeMap::new(),
                })
            });

            map = match child {
                ParameterTree::Node(m) => m,
                ParameterTree::Leaf(p) => {
                    return Err(Error::NotAMap {
                        path: p.path.clone(),
                    });
                }
            };
        }

        let path = append_path(&map.path, key);
        match map.map.get_mut(key) {
            Some(ParameterTree::Leaf(p)) if matches!(p.value, ParameterValue::Float { .. }) => {
                p.value = ParameterValue::Float { val };
            }
            Some(ParameterTree::Leaf(p)) => return Err(p.bad_cast("float")),
            Some(ParameterTree::Node(_)) => return Err(Error::NotAParameter { path }),
            None => {
                map.map.insert(
                    key.to_string(),
                    ParameterTree::Leaf(Parameter {
                        path,
                        value: ParameterValue::Float { val },
                    }),
                );
            }
        }

        Ok(())
    }

    pub fn to_toml(&self) -> Result<Table, Error> {
        self.map
            .iter()
            .map(|(key, tree)| {
                let value = match tree {
                    ParameterTree::Node(m) => Value::Table(m.to_toml()?),
                    ParameterTree::Leaf(p) => Value::try_from(&p.value)?,
                };
                Ok((key.clone(), value))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterTree {
    Node(ParameterMap),
    Leaf(Parameter),
}

impl ParameterTree {
    fn as_param(&self) -> Result<&Parameter, Error> {
        match self {
            Self::Leaf(p) => Ok(p),
            Self::Node(m) => Err(Error::NotAParameter { path: m.path.clone() }),
        }
    }

    fn as_map(&self) -> Result<&ParameterMap, Error> {
        match self {
            Self::Node(m) => Ok(m),
            Self::Leaf(p) => Err(Error::NotAMap { path: p.path.clone() }),
        }
    }
}

pub fn parse_string(toml_str: &str) -> Result<ParameterMap, Error> {
    let table = toml::from_str::<Table>(toml_str)?;

    parse_table(table, String::new())
}

fn parse_table(table: Table, root: String) -> Result<ParameterMap, Error> {
    let mut nodes = BTreeMap::new();

    for (key, val) in table.into_iter() {
        let path = append_path(&root, &key);
        match val {
            Value::Table(val) => {
                if val.contains_key("type") {
                    let value = val
                        .try_into::<ParameterValue>()
                        .map_err(|_| Error::BadToml(path.clone()))?;
                    nodes.insert(key, ParameterTree::Leaf(Parameter { path, value }));
                } else {
                    nodes.insert(key, ParameterTree::Node(parse_table(val, path)?));
                }
            }
            _ => {
                return Err(Error::BadToml(path));
            }
        }
    }

    Ok(ParameterMap {
        path: root,
        map: nodes,
    })
}

fn append_path(root: &str, key: &str) -> String {
    if root.is_empty() {
        key.to_string()
    } else {
        format!("{root}.{key}")
    }
}
