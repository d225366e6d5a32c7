use rusqlite::types::Value;

use super::{mismatch, Resolution, ResolveCx, Resolver};
use crate::adapter::validate_identifier;
use crate::error::Result;
use crate::xlink::{Category, DeferredRef};

/// Writes plain links: a column update of the owning row, or a link-table row.
pub struct BasicResolver;

impl Resolver for BasicResolver {
    fn category(&self) -> Category {
        Category::Basic
    }

    fn resolve(&mut self, record: &DeferredRef, cx: &mut ResolveCx<'_>) -> Result<Resolution> {
        let DeferredRef::Basic(link) = record else {
            return Err(mismatch(Category::Basic, record));
        };
        let Some(target) = cx.cache.get(&link.target)? else {
            return Ok(Resolution::Dangling);
        };
        let table = validate_identifier(&link.table)?;
        let to_column = validate_identifier(&link.to_column)?;
        let (owner, target_id) = if link.reverse {
            (target.id, link.id)
        } else {
            (link.id, target.id)
        };

        match &link.from_column {
            None => cx.batch.push(
                format!("UPDATE {table} SET {to_column} = ?1 WHERE id = ?2"),
                vec![Value::Integer(target_id), Value::Integer(owner)],
            )?,
            Some(from_column) => {
                let from_column = validate_identifier(from_column)?;
                match &link.role {
                    Some(role) => cx.batch.insert(
                        table,
                        &[from_column, "role", to_column],
                        vec![
                            Value::Integer(owner),
                            Value::Text(role.clone()),
                            Value::Integer(target_id),
                        ],
                    )?,
                    None => cx.batch.insert(
                        table,
                        &[from_column, to_column],
                        vec![Value::Integer(owner), Value::Integer(target_id)],
                    )?,
                }
            }
        }
        Ok(Resolution::Resolved)
    }
}
