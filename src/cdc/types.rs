use super::Lsn;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Row operation decoded from the change table's `__$operation` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Delete,
    Insert,
    Update,
}

impl Operation {
    /// Decodes an operation code.
    ///
    /// `3` is the update before-image and yields `Ok(None)`; codes outside
    /// `{1, 2, 3, 4}` mean the change table is not what the monitor expects.
    pub fn from_code(table: &str, code: i32) -> Result<Option<Operation>> {
        match code {
            1 => Ok(Some(Operation::Delete)),
            2 => Ok(Some(Operation::Insert)),
            3 => Ok(None),
            4 => Ok(Some(Operation::Update)),
            other => Err(Error::schema_drift(
                table,
                format!("unknown operation code {}", other),
            )),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Operation::Delete => 1,
            Operation::Insert => 2,
            Operation::Update => 4,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Delete => "Delete",
            Operation::Insert => "Insert",
            Operation::Update => "Update",
        };
        f.write_str(name)
    }
}

/// One row read from a change table. `values` follow the discovered column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRow {
    pub lsn: Lsn,
    pub seqval: Vec<u8>,
    pub operation: i32,
    pub values: Vec<Option<String>>,
}

impl ChangeRow {
    pub fn new(lsn: Lsn, seqval: u64, operation: i32, values: Vec<Option<String>>) -> Self {
        Self {
            lsn,
            seqval: seqval.to_be_bytes().to_vec(),
            operation,
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventMetadata {
    pub table_name: String,
    #[serde(rename = "LSN")]
    pub lsn: String,
    #[serde(rename = "OperationID")]
    pub operation_id: i32,
    pub operation_type: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_queue: Option<String>,
}

/// A row change as it travels through the ingest queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub metadata: EventMetadata,
    pub data: BTreeMap<String, Option<String>>,
    #[serde(skip)]
    pub lsn: Lsn,
}

impl ChangeEvent {
    /// Shapes a change row into an event.
    ///
    /// Returns `Ok(None)` for update before-images.
    pub fn from_row(table: &str, columns: &[String], row: &ChangeRow) -> Result<Option<Self>> {
        let Some(operation) = Operation::from_code(table, row.operation)? else {
            return Ok(None);
        };
        if row.values.len() != columns.len() {
            return Err(Error::schema_drift(
                table,
                format!(
                    "row has {} values but {} columns were discovered",
                    row.values.len(),
                    columns.len()
                ),
            ));
        }

        let data = columns
            .iter()
            .cloned()
            .zip(row.values.iter().cloned())
            .collect();

        Ok(Some(Self {
            metadata: EventMetadata {
                table_name: table.to_string(),
                lsn: row.lsn.to_hex(),
                operation_id: operation.code(),
                operation_type: operation,
                destination: None,
                ingest_queue: None,
            },
            data,
            lsn: row.lsn,
        }))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Immutable description of a monitored table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: String,
    pub schema: String,
    pub capture_schema: String,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub destination: String,
}

impl TableDescriptor {
    /// Name of the change table, e.g. `dbo_Persons_CT`.
    pub fn change_table(&self) -> String {
        format!("{}_{}_CT", self.schema, self.name)
    }

    /// Fully qualified, quoted change table for use in SQL.
    pub fn qualified_change_table(&self) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.capture_schema),
            quote_ident(&self.change_table())
        )
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
