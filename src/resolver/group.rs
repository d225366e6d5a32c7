use rusqlite::types::Value;

use super::{mismatch, Resolution, ResolveCx, Resolver};
use crate::cache::CacheTag;
use crate::error::{ImportError, Result};
use crate::xlink::{Category, DeferredRef};

/// Writes group memberships and group parent links.
///
/// A member that is itself a group with memberships still pending in the
/// current snapshot is retried in the next pass, so nested groups land
/// innermost first. A genuine membership cycle keeps the pending count
/// constant and is cut off by the splitter.
pub struct GroupMemberResolver;

impl Resolver for GroupMemberResolver {
    fn category(&self) -> Category {
        Category::GroupMember
    }

    fn resolve(&mut self, record: &DeferredRef, cx: &mut ResolveCx<'_>) -> Result<Resolution> {
        let DeferredRef::GroupMember(link) = record else {
            return Err(mismatch(Category::GroupMember, record));
        };
        let Some(target) = cx.cache.get(&link.target)? else {
            return Ok(Resolution::Dangling);
        };
        if !target.tag.is_feature() {
            return Err(ImportError::Invalid(format!(
                "group member '{}' is not a feature",
                link.target
            )));
        }

        if link.is_parent {
            cx.batch.push(
                "UPDATE feature SET group_parent_id = ?1 WHERE id = ?2",
                vec![Value::Integer(target.id), Value::Integer(link.group_id)],
            )?;
            return Ok(Resolution::Resolved);
        }

        if target.tag == CacheTag::Group
            && cx
                .store
                .snapshot_has_owner(Category::GroupMember, &[target.id])?
        {
            return Ok(Resolution::Retry);
        }
        cx.batch.insert(
            "group_member",
            &["group_id", "member_id", "role"],
            vec![
                Value::Integer(link.group_id),
                Value::Integer(target.id),
                link.role.clone().map_or(Value::Null, Value::Text),
            ],
        )?;
        Ok(Resolution::Resolved)
    }
}
