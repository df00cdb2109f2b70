//! Transaction events broadcast between cluster members
//!
//! A [`TransactionEvent`] summarizes the row-level changes of one committed
//! transaction. It is built once by the committing side and never mutated
//! afterwards: its fields are private and only exposed through accessors.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a running server instance
pub type ServerId = String;

/// Primary key value of a changed row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PkValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for PkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkValue::Int(v) => write!(f, "{}", v),
            PkValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for PkValue {
    fn from(v: i64) -> Self {
        PkValue::Int(v)
    }
}

impl From<i32> for PkValue {
    fn from(v: i32) -> Self {
        PkValue::Int(v as i64)
    }
}

impl From<u32> for PkValue {
    fn from(v: u32) -> Self {
        PkValue::Int(v as i64)
    }
}

impl From<&str> for PkValue {
    fn from(v: &str) -> Self {
        PkValue::Text(v.to_string())
    }
}

impl From<String> for PkValue {
    fn from(v: String) -> Self {
        PkValue::Text(v)
    }
}

/// Changes made to a single table within a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    /// Table name
    pub table: String,
    /// Primary keys of inserted rows
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub inserted: BTreeSet<PkValue>,
    /// Primary keys of updated rows
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub updated: BTreeSet<PkValue>,
    /// Primary keys of deleted rows
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deleted: BTreeSet<PkValue>,
    /// Table-level change with no key information (bulk update or delete
    /// statement); peers evict the whole table region
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bulk: bool,
}

impl TableChange {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            inserted: BTreeSet::new(),
            updated: BTreeSet::new(),
            deleted: BTreeSet::new(),
            bulk: false,
        }
    }

    /// A table-level change, e.g. from a bulk `UPDATE ... WHERE` statement
    pub fn bulk(table: impl Into<String>) -> Self {
        Self {
            bulk: true,
            ..Self::new(table)
        }
    }

    pub fn insert(mut self, key: impl Into<PkValue>) -> Self {
        self.inserted.insert(key.into());
        self
    }

    pub fn update(mut self, key: impl Into<PkValue>) -> Self {
        self.updated.insert(key.into());
        self
    }

    pub fn delete(mut self, key: impl Into<PkValue>) -> Self {
        self.deleted.insert(key.into());
        self
    }

    /// True when the change carries nothing to invalidate
    pub fn is_empty(&self) -> bool {
        !self.bulk && self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Union of inserted, updated and deleted keys, in key order
    pub fn affected_keys(&self) -> Vec<PkValue> {
        let keys: BTreeSet<&PkValue> = self
            .inserted
            .iter()
            .chain(self.updated.iter())
            .chain(self.deleted.iter())
            .collect();
        keys.into_iter().cloned().collect()
    }
}

/// Immutable summary of one committed transaction's row-level changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    origin_server_id: ServerId,
    transaction_id: u64,
    table_changes: Vec<TableChange>,
    timestamp: DateTime<Utc>,
}

impl TransactionEvent {
    pub fn new(
        origin_server_id: impl Into<ServerId>,
        transaction_id: u64,
        table_changes: Vec<TableChange>,
    ) -> Self {
        Self {
            origin_server_id: origin_server_id.into(),
            transaction_id,
            table_changes,
            timestamp: Utc::now(),
        }
    }

    pub fn builder(
        origin_server_id: impl Into<ServerId>,
        transaction_id: u64,
    ) -> TransactionEventBuilder {
        TransactionEventBuilder {
            origin_server_id: origin_server_id.into(),
            transaction_id,
            table_changes: Vec::new(),
            timestamp: None,
        }
    }

    pub fn origin_server_id(&self) -> &str {
        &self.origin_server_id
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    pub fn table_changes(&self) -> &[TableChange] {
        &self.table_changes
    }

    /// Commit wall-clock time. Informational only.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_empty(&self) -> bool {
        self.table_changes.iter().all(TableChange::is_empty)
    }

    /// Names of the tables touched by this event, in change order
    pub fn tables(&self) -> Vec<&str> {
        self.table_changes.iter().map(|c| c.table.as_str()).collect()
    }

    /// The same transaction with every non-empty change widened to a
    /// table-level change. Keeps origin, transaction id and timestamp so
    /// peers deduplicate it like the keyed form.
    pub fn to_table_level(&self) -> TransactionEvent {
        let mut tables: Vec<&str> = Vec::new();
        for change in self.table_changes.iter().filter(|c| !c.is_empty()) {
            if !tables.contains(&change.table.as_str()) {
                tables.push(&change.table);
            }
        }

        TransactionEvent {
            origin_server_id: self.origin_server_id.clone(),
            transaction_id: self.transaction_id,
            table_changes: tables.into_iter().map(TableChange::bulk).collect(),
            timestamp: self.timestamp,
        }
    }
}

/// Builder for [`TransactionEvent`]
#[derive(Debug, Clone)]
pub struct TransactionEventBuilder {
    origin_server_id: ServerId,
    transaction_id: u64,
    table_changes: Vec<TableChange>,
    timestamp: Option<DateTime<Utc>>,
}

impl TransactionEventBuilder {
    pub fn change(mut self, change: TableChange) -> Self {
        self.table_changes.push(change);
        self
    }

    pub fn changes(mut self, changes: impl IntoIterator<Item = TableChange>) -> Self {
        self.table_changes.extend(changes);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> TransactionEvent {
        TransactionEvent {
            origin_server_id: self.origin_server_id,
            transaction_id: self.transaction_id,
            table_changes: self.table_changes,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}
