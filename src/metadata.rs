//! provides the immutable table-shape lookup the composer consults when
//! expanding a base source into a projection.
//!
//! Building the catalog (from migrations, attributes, a schema dump) belongs
//! to the caller; by the time a query compiles, the catalog is a pre-built,
//! read-only map.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::ir::{Projection, Select, Table};
use crate::types::ValueType;

#[derive(Debug, Clone)]
pub struct TableShape {
    pub name: String,
    pub columns: Vec<(String, ValueType)>,
}

impl TableShape {
    pub fn new(name: impl Into<String>, columns: Vec<(&str, ValueType)>) -> TableShape {
        TableShape {
            name: name.into(),
            columns: columns.into_iter().map(|(n, t)| (n.to_string(), t)).collect(),
        }
    }

    pub fn column_type(&self, column: &str) -> Option<ValueType> {
        self.columns.iter().find(|(n, _)| n == column).map(|(_, t)| *t)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: HashMap<String, TableShape>,
}

impl Catalog {
    pub fn new() -> Catalog {
        Catalog { tables: HashMap::new() }
    }

    pub fn with_table(mut self, shape: TableShape) -> Catalog {
        self.tables.insert(shape.name.clone(), shape);
        self
    }

    pub fn get(&self, name: &str) -> Result<&TableShape> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    /// Expands a base source into its initial select: a scan of the table
    /// under the given alias, projecting a record of every mapped column.
    pub fn source_select(&self, table: &str, alias: &str) -> Result<Select> {
        let shape = self.get(table)?;
        let fields = shape
            .columns
            .iter()
            .map(|(name, ty)| (name.clone(), Expr::column(alias, name.clone(), Some(*ty))))
            .collect();
        Ok(Select::new(
            Projection::Server(Expr::Record(fields)),
            Some(Table::Base { name: shape.name.clone(), alias: alias.to_string() }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_select_projects_all_columns() {
        let catalog = Catalog::new().with_table(TableShape::new(
            "users",
            vec![("id", ValueType::Int), ("name", ValueType::Text)],
        ));
        let sel = catalog.source_select("users", "t0").unwrap();
        match sel.projection {
            Projection::Server(Expr::Record(fields)) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].0, "id");
                assert_eq!(fields[1].0, "name");
            }
            _ => panic!("expected record projection"),
        }
        assert!(catalog.source_select("missing", "t1").is_err());
    }
}
