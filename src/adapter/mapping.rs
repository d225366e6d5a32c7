use std::collections::HashMap;

use crate::adapter::validate_identifier;
use crate::error::Result;

/// Default link table for references without a dedicated column.
pub const LINK_TABLE: &str = "feature_reference";

/// Where a resolved feature reference is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceTarget {
    /// Column of the owning `feature` row.
    FeatureColumn(String),
    /// Row in a link table holding owner, role and target.
    LinkTable {
        /// Link table name.
        table: String,
        /// Column receiving the owner id.
        from_column: String,
        /// Column receiving the target id.
        to_column: String,
    },
}

/// Role to destination registry, fixed once when the adapter opens.
#[derive(Debug, Clone)]
pub struct ReferenceMapping {
    columns: HashMap<String, String>,
}

impl Default for ReferenceMapping {
    fn default() -> Self {
        Self {
            columns: HashMap::from([("address".to_string(), "address_id".to_string())]),
        }
    }
}

impl ReferenceMapping {
    /// Routes `role` into `column` of the `feature` table.
    pub fn with_column(mut self, role: impl Into<String>, column: &str) -> Result<Self> {
        validate_identifier(column)?;
        self.columns.insert(role.into(), column.to_string());
        Ok(self)
    }

    /// Destination for references named `role`.
    pub fn resolve(&self, role: &str) -> ReferenceTarget {
        match self.columns.get(role) {
            Some(column) => ReferenceTarget::FeatureColumn(column.clone()),
            None => ReferenceTarget::LinkTable {
                table: LINK_TABLE.to_string(),
                from_column: "feature_id".to_string(),
                to_column: "target_id".to_string(),
            },
        }
    }
}
