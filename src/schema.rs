//! Schema: read-only table metadata consumed by the passes
//!
//! Tracks tables, their columns, indexes (primary and unique) and foreign
//! keys. The passes never modify the schema; it is shared through
//! `PlanContext` as an `Arc<Schema>`.

use crate::error::{PlanError, PlanResult};
use crate::plan::DataType;
use std::collections::HashMap;

/// Column definition
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

/// Index definition; `columns` are positions in the owning table
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<usize>,
    pub unique: bool,
    pub primary: bool,
}

/// Foreign key from `columns` of the owning table to
/// `referenced_columns` of `referenced_table`, enforced by `referenced_index`
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyDef {
    pub name: String,
    pub columns: Vec<usize>,
    pub referenced_table: String,
    pub referenced_index: String,
    pub referenced_columns: Vec<usize>,
}

/// Table definition
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl TableDef {
    /// Create a table with the given `(name, type, nullable)` columns
    pub fn new(name: impl Into<String>, columns: &[(&str, DataType, bool)]) -> Self {
        TableDef {
            name: name.into(),
            columns: columns
                .iter()
                .map(|(name, data_type, nullable)| ColumnDef {
                    name: (*name).to_string(),
                    data_type: *data_type,
                    nullable: *nullable,
                })
                .collect(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Declare the primary key (named `PRIMARY`)
    pub fn with_primary_key(mut self, columns: &[&str]) -> PlanResult<Self> {
        let columns = self.positions(columns)?;
        self.indexes.push(IndexDef {
            name: "PRIMARY".to_string(),
            columns,
            unique: true,
            primary: true,
        });
        Ok(self)
    }

    /// Declare a secondary index
    pub fn with_index(mut self, name: &str, columns: &[&str], unique: bool) -> PlanResult<Self> {
        let columns = self.positions(columns)?;
        self.indexes.push(IndexDef {
            name: name.to_string(),
            columns,
            unique,
            primary: false,
        });
        Ok(self)
    }

    /// Declare a foreign key; the referenced side is resolved against `parent`
    pub fn with_foreign_key(
        mut self,
        name: &str,
        columns: &[&str],
        parent: &TableDef,
        referenced_index: &str,
    ) -> PlanResult<Self> {
        let columns = self.positions(columns)?;
        let index = parent.index(referenced_index).ok_or_else(|| {
            PlanError::Schema(format!(
                "Index '{referenced_index}' not found on table '{}'",
                parent.name
            ))
        })?;
        if index.columns.len() != columns.len() {
            return Err(PlanError::Schema(format!(
                "Foreign key '{name}' has {} columns but index '{referenced_index}' has {}",
                columns.len(),
                index.columns.len()
            )));
        }
        self.foreign_keys.push(ForeignKeyDef {
            name: name.to_string(),
            columns,
            referenced_table: parent.name.clone(),
            referenced_index: referenced_index.to_string(),
            referenced_columns: index.columns.clone(),
        });
        Ok(self)
    }

    /// Find position of a column by name
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, position: usize) -> Option<&ColumnDef> {
        self.columns.get(position)
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn primary_key(&self) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.primary)
    }

    /// Unique indexes, primary key included
    pub fn unique_indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes.iter().filter(|i| i.unique)
    }

    fn positions(&self, columns: &[&str]) -> PlanResult<Vec<usize>> {
        columns
            .iter()
            .map(|name| {
                self.column_position(name).ok_or_else(|| {
                    PlanError::Schema(format!("Column '{name}' not found in table '{}'", self.name))
                })
            })
            .collect()
    }
}

/// Schema tracks definitions for all tables
#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: HashMap<String, TableDef>,
}

impl Schema {
    /// Create a new empty schema
    pub fn new() -> Self {
        Schema {
            tables: HashMap::new(),
        }
    }

    /// Register a table definition
    pub fn add_table(&mut self, table: TableDef) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Check if a table exists
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table(&self, name: &str) -> PlanResult<&TableDef> {
        self.tables
            .get(name)
            .ok_or_else(|| PlanError::Schema(format!("Table '{name}' not found")))
    }

    /// Get all registered table names
    pub fn all_tables(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }
}
