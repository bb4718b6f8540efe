//! Locomotive records
//!
//! A locomotive is addressed on the track by its decoder address; the store
//! addresses it by the row id assigned on insert.

use crate::repository::{Record, Table};
use serde::{Deserialize, Serialize};

/// A locomotive known to the layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locomotive {
    /// Store-assigned identifier, `None` until inserted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Display name
    pub name: String,
    /// Decoder address on the command station
    pub address: u16,
    /// Labels of the decoder functions F0, F1, ...
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Locomotive {
    /// Create an unsaved locomotive
    pub fn new(name: impl Into<String>, address: u16) -> Self {
        Self {
            id: None,
            name: name.into(),
            address,
            functions: Vec::new(),
            notes: None,
        }
    }
}

impl Record for Locomotive {
    const TABLE: Table = Table::new("locomotives");

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn search_text(&self) -> String {
        format!("{} {}", self.name, self.address)
    }
}

impl std::fmt::Display for Locomotive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}
