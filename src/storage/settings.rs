//! Typed key-value entries

use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use super::schema;
use super::statement::{Handle, Statement};
use crate::Result;

/// A scalar stored in the key-value table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl StoredValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            StoredValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StoredValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Integers widen to `f64`
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StoredValue::Real(x) => Some(*x),
            StoredValue::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StoredValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for StoredValue {
    fn from(value: bool) -> Self {
        StoredValue::Bool(value)
    }
}

impl From<i64> for StoredValue {
    fn from(value: i64) -> Self {
        StoredValue::Integer(value)
    }
}

impl From<i32> for StoredValue {
    fn from(value: i32) -> Self {
        StoredValue::Integer(value.into())
    }
}

impl From<f64> for StoredValue {
    fn from(value: f64) -> Self {
        StoredValue::Real(value)
    }
}

impl From<String> for StoredValue {
    fn from(value: String) -> Self {
        StoredValue::Text(value)
    }
}

impl From<&str> for StoredValue {
    fn from(value: &str) -> Self {
        StoredValue::Text(value.to_owned())
    }
}

impl std::fmt::Display for StoredValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoredValue::Bool(b) => write!(f, "{}", b),
            StoredValue::Integer(n) => write!(f, "{}", n),
            StoredValue::Real(x) => write!(f, "{}", x),
            StoredValue::Text(s) => f.write_str(s),
        }
    }
}

/// Prepared read/upsert pair over the key-value table
pub(crate) struct Settings {
    select: Statement,
    upsert: Statement,
}

impl Settings {
    pub(crate) async fn prepare(handle: &Handle) -> Result<Self> {
        Ok(Self {
            select: Statement::prepare(handle, schema::SELECT_VALUE).await?,
            upsert: Statement::prepare(handle, schema::UPSERT_VALUE).await?,
        })
    }

    pub(crate) async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        self.select
            .get_with(vec![Value::Text(key.to_owned())], |row| {
                row.map(|row| -> Result<StoredValue> {
                    let text: String = row.get(0)?;
                    Ok(serde_json::from_str(&text)?)
                })
                .transpose()
            })
            .await
    }

    pub(crate) async fn set(&self, key: &str, value: &StoredValue) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.upsert
            .run(vec![Value::Text(key.to_owned()), Value::Text(encoded)])
            .await?;
        Ok(())
    }

    pub(crate) fn release(&self) {
        self.select.release();
        self.upsert.release();
    }
}
