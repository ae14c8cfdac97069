// ABOUTME: Static, typed description of every replicated table
// ABOUTME: Columns, delta timestamp column, create DDL and deferred foreign keys

mod tables;

use std::collections::HashSet;
use std::fmt;

use crate::error::ReplicationError;

/// How a column's source value is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Text,
    Boolean,
    Decimal,
    Timestamp,
}

/// A single replicated column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub const fn new(name: &'static str, kind: ColumnKind) -> Self {
        Self { name, kind }
    }
}

/// The column used to select a table's delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampColumn {
    CreatedAt,
    UpdatedAt,
    DateApproved,
}

impl TimestampColumn {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampColumn::CreatedAt => "created_at",
            TimestampColumn::UpdatedAt => "updated_at",
            TimestampColumn::DateApproved => "date_approved",
        }
    }
}

impl fmt::Display for TimestampColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Referential action for `ON UPDATE` / `ON DELETE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FkAction {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl FkAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            FkAction::NoAction => "NO ACTION",
            FkAction::Restrict => "RESTRICT",
            FkAction::Cascade => "CASCADE",
            FkAction::SetNull => "SET NULL",
            FkAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// A foreign key added after every table exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKeyConstraint {
    pub name: &'static str,
    pub owning_table: &'static str,
    pub column: &'static str,
    pub referenced_table: &'static str,
    pub referenced_column: &'static str,
    pub on_update: FkAction,
    pub on_delete: FkAction,
}

impl ForeignKeyConstraint {
    /// `ALTER TABLE` statement adding this constraint.
    pub fn to_ddl(&self) -> String {
        format!(
            "ALTER TABLE IF EXISTS public.{owner} \
             ADD CONSTRAINT {name} FOREIGN KEY ({column}) \
             REFERENCES public.{referenced} ({referenced_column}) MATCH SIMPLE \
             ON UPDATE {on_update} ON DELETE {on_delete}",
            owner = crate::utils::quote_ident(self.owning_table),
            name = crate::utils::quote_ident(self.name),
            column = crate::utils::quote_ident(self.column),
            referenced = crate::utils::quote_ident(self.referenced_table),
            referenced_column = crate::utils::quote_ident(self.referenced_column),
            on_update = self.on_update.as_sql(),
            on_delete = self.on_delete.as_sql(),
        )
    }
}

/// Everything the engine needs to know about one replicated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
    pub timestamp_column: TimestampColumn,
    pub create_ddl: &'static str,
    pub foreign_keys: &'static [ForeignKeyConstraint],
}

impl TableSpec {
    /// Column names in declaration order.
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    /// Position of the delta timestamp column in `columns`.
    pub fn timestamp_index(&self) -> Option<usize> {
        let wanted = self.timestamp_column.as_str();
        self.columns.iter().position(|c| c.name == wanted)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Check the per-table invariants.
    pub fn validate(&self) -> Result<(), ReplicationError> {
        crate::utils::validate_postgres_identifier(self.name)
            .map_err(|e| ReplicationError::InvalidRegistry(e.to_string()))?;

        if self.columns.is_empty() {
            return Err(ReplicationError::InvalidRegistry(format!(
                "table '{}' declares no columns",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for column in self.columns {
            crate::utils::validate_postgres_identifier(column.name)
                .map_err(|e| ReplicationError::InvalidRegistry(e.to_string()))?;
            if !seen.insert(column.name) {
                return Err(ReplicationError::InvalidRegistry(format!(
                    "table '{}' declares column '{}' twice",
                    self.name, column.name
                )));
            }
        }

        match self.timestamp_index() {
            Some(idx) if self.columns[idx].kind == ColumnKind::Timestamp => {}
            Some(_) => {
                return Err(ReplicationError::InvalidRegistry(format!(
                    "timestamp column '{}' of table '{}' is not a timestamp",
                    self.timestamp_column, self.name
                )))
            }
            None => {
                return Err(ReplicationError::InvalidRegistry(format!(
                    "timestamp column '{}' is not a column of table '{}'",
                    self.timestamp_column, self.name
                )))
            }
        }

        for fk in self.foreign_keys {
            if fk.owning_table != self.name {
                return Err(ReplicationError::InvalidRegistry(format!(
                    "foreign key '{}' is declared on '{}' but owned by '{}'",
                    fk.name, self.name, fk.owning_table
                )));
            }
            if !self.has_column(fk.column) {
                return Err(ReplicationError::InvalidRegistry(format!(
                    "foreign key '{}' uses unknown column '{}.{}'",
                    fk.name, self.name, fk.column
                )));
            }
        }

        Ok(())
    }
}

/// Ordered set of replicated tables.
///
/// Declaration order is replication order; referenced tables come before the
/// tables referencing them.
#[derive(Debug, Clone)]
pub struct Registry {
    tables: Vec<TableSpec>,
}

impl Registry {
    /// Build and validate a registry.
    pub fn new(tables: Vec<TableSpec>) -> Result<Self, ReplicationError> {
        let mut names = HashSet::new();
        for table in &tables {
            table.validate()?;
            if !names.insert(table.name) {
                return Err(ReplicationError::InvalidRegistry(format!(
                    "table '{}' is registered twice",
                    table.name
                )));
            }
        }

        for table in &tables {
            for fk in table.foreign_keys {
                let referenced = tables
                    .iter()
                    .find(|t| t.name == fk.referenced_table)
                    .ok_or_else(|| {
                        ReplicationError::InvalidRegistry(format!(
                            "foreign key '{}' references unregistered table '{}'",
                            fk.name, fk.referenced_table
                        ))
                    })?;
                if !referenced.has_column(fk.referenced_column) {
                    return Err(ReplicationError::InvalidRegistry(format!(
                        "foreign key '{}' references unknown column '{}.{}'",
                        fk.name, fk.referenced_table, fk.referenced_column
                    )));
                }
            }
        }

        Ok(Self { tables })
    }

    /// The operational schema replicated into the analytics database.
    pub fn analytics() -> Result<Self, ReplicationError> {
        Self::new(tables::ANALYTICS_TABLES.to_vec())
    }

    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// All foreign keys, in table declaration order.
    pub fn constraints(&self) -> Vec<ForeignKeyConstraint> {
        self.tables
            .iter()
            .flat_map(|t| t.foreign_keys.iter().copied())
            .collect()
    }
}
