use rusqlite::types::Value;
use tracing::{debug, warn};

use super::{flag, int, invalid, text, Converter};
use crate::adapter::{IdTable, ReferenceTarget};
use crate::cache::CacheTag;
use crate::error::{ImportError, Result};
use crate::model::{local_target, AttributeValue, Feature, Property};
use crate::xlink::{BasicLink, DeferredRef, GroupMembership, MaterialLink};

/// Position of a nested feature inside its top-level feature.
#[derive(Debug, Clone, Copy)]
pub(super) struct Lineage {
    parent_id: i64,
    root_id: i64,
}

impl Converter<'_> {
    /// Converts `feature` and everything it owns. Returns `None` when a nested
    /// feature was skipped as a duplicate.
    pub(super) fn feature(&mut self, feature: &Feature, lineage: Option<Lineage>) -> Result<Option<i64>> {
        let adapter = self.adapter;
        let sequences = adapter.sequences();
        let id = match feature.gml_id.as_deref() {
            Some(gml_id) => {
                let tag = if feature.is_group() {
                    CacheTag::Group
                } else {
                    CacheTag::Feature
                };
                let (entry, created) = self.claim(gml_id, tag, || Ok(sequences.next(IdTable::Feature)))?;
                if !created {
                    let cause = invalid(format!("duplicate gml:id, first imported as {}", entry.id));
                    if lineage.is_none() {
                        return Err(ImportError::row(gml_id, cause));
                    }
                    warn!(gml_id, existing = entry.id, "convert.feature.duplicate");
                    return Ok(None);
                }
                entry.id
            }
            None => sequences.next(IdTable::Feature),
        };
        let root_id = lineage.map_or(id, |l| l.root_id);

        let mut columns: Vec<String> = ["id", "gmlid", "objectclass", "toplevel", "parent_id", "root_id"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        let mut values = vec![
            Value::Integer(id),
            text(feature.gml_id.as_deref()),
            Value::Text(feature.object_class.clone()),
            flag(feature.top_level && lineage.is_none()),
            int(lineage.map(|l| l.parent_id)),
            Value::Integer(root_id),
        ];
        for property in &feature.properties {
            let Property::Reference { role, href } = property else {
                continue;
            };
            let ReferenceTarget::FeatureColumn(column) = adapter.mapping().resolve(role) else {
                continue;
            };
            let Some(target) = local_target(href) else {
                debug!(gml_id = feature.label(), href, "convert.reference.remote");
                continue;
            };
            match self.cache.get(target)? {
                Some(entry) if entry.tag.is_feature() && !columns.contains(&column) => {
                    columns.push(column);
                    values.push(Value::Integer(entry.id));
                }
                _ => self.defer(DeferredRef::Basic(BasicLink {
                    table: "feature".into(),
                    id,
                    from_column: None,
                    to_column: column,
                    role: None,
                    reverse: false,
                    target: target.to_string(),
                })),
            }
        }
        let column_names: Vec<&str> = columns.iter().map(String::as_str).collect();
        self.batch.insert("feature", &column_names, values)?;
        self.unit.features += 1;
        if feature.top_level && lineage.is_none() {
            self.unit.top_level += 1;
        }
        self.unit.classes.push(feature.object_class.clone());

        for property in &feature.properties {
            self.property(feature, id, root_id, property)?;
        }
        Ok(Some(id))
    }

    fn property(&mut self, feature: &Feature, id: i64, root_id: i64, property: &Property) -> Result<()> {
        match property {
            Property::Attribute { name, value } => {
                let (value_text, value_num) = match value {
                    AttributeValue::Bool(b) => (None, Some(if *b { 1.0 } else { 0.0 })),
                    AttributeValue::Int(i) => (None, Some(*i as f64)),
                    AttributeValue::Float(f) => (None, Some(*f)),
                    AttributeValue::Text(s) => (Some(s.as_str()), None),
                };
                self.batch.insert(
                    "feature_attribute",
                    &["feature_id", "name", "value_text", "value_num"],
                    vec![
                        Value::Integer(id),
                        Value::Text(name.clone()),
                        text(value_text),
                        value_num.map_or(Value::Null, Value::Real),
                    ],
                )?;
            }
            Property::Reference { role, href } => {
                let ReferenceTarget::LinkTable {
                    table,
                    from_column,
                    to_column,
                } = self.adapter.mapping().resolve(role)
                else {
                    return Ok(());
                };
                let Some(target) = local_target(href) else {
                    debug!(gml_id = feature.label(), href, "convert.reference.remote");
                    return Ok(());
                };
                match self.cache.get(target)? {
                    Some(entry) if entry.tag.is_feature() => {
                        self.batch.insert(
                            &table,
                            &[from_column.as_str(), "role", to_column.as_str()],
                            vec![
                                Value::Integer(id),
                                Value::Text(role.clone()),
                                Value::Integer(entry.id),
                            ],
                        )?;
                    }
                    _ => self.defer(DeferredRef::Basic(BasicLink {
                        table,
                        id,
                        from_column: Some(from_column),
                        to_column,
                        role: Some(role.clone()),
                        reverse: false,
                        target: target.to_string(),
                    })),
                }
            }
            Property::Child { feature: child, .. } => {
                self.feature(
                    child,
                    Some(Lineage {
                        parent_id: id,
                        root_id,
                    }),
                )?;
            }
            Property::Geometry { role, geometry } => {
                self.geometry_root(geometry, id, role)?;
            }
            Property::Appearance { appearance } => {
                self.appearance(appearance, id)?;
            }
            Property::GroupMember { role, href } => {
                if !feature.is_group() {
                    warn!(gml_id = feature.label(), "convert.group_member.not_a_group");
                    return Ok(());
                }
                if let Some(target) = local_target(href) {
                    self.defer(DeferredRef::GroupMember(GroupMembership {
                        group_id: id,
                        target: target.to_string(),
                        role: role.clone(),
                        is_parent: false,
                    }));
                }
            }
            Property::GroupParent { href } => {
                if let Some(target) = local_target(href) {
                    self.defer(DeferredRef::GroupMember(GroupMembership {
                        group_id: id,
                        target: target.to_string(),
                        role: None,
                        is_parent: true,
                    }));
                }
            }
            Property::Material { href, target } => {
                if let (Some(material), Some(target)) = (local_target(href), local_target(target)) {
                    self.defer(DeferredRef::DeprecatedMaterial(MaterialLink {
                        material: material.to_string(),
                        target: target.to_string(),
                    }));
                }
            }
        }
        Ok(())
    }
}
