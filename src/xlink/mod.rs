//! Deferred cross references ("xlinks").
//!
//! A [`DeferredRef`] is written whenever a reference could not be rewritten
//! at conversion time. Records live in the [`DeferredStore`] until the
//! resolver of their [`Category`] consumes them.

mod registrar;
mod store;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use registrar::Registrar;
pub use store::{DeferredStore, SnapshotCursor, StoreReader};
pub(crate) use store::append_records;

/// Reference category. The declaration order is the resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    /// Plain row link: column update or link-table insert.
    Basic,
    /// Group membership and group parent links.
    GroupMember,
    /// Texture image payloads loaded from disk.
    TextureImage,
    /// Texture coordinates targeting a ring.
    TextureCoordList,
    /// Texture parameterization of a surface.
    TextureParam,
    /// Parameterization reused by identifier.
    TextureAssociation,
    /// Legacy material links.
    DeprecatedMaterial,
    /// Geometry reused by identifier.
    SurfaceGeometry,
    /// Solid representation rebuilt from its resolved shell.
    SolidGeometry,
}

impl Category {
    /// Every category in sweep order.
    pub const SWEEP_ORDER: [Category; 9] = [
        Category::Basic,
        Category::GroupMember,
        Category::TextureImage,
        Category::TextureCoordList,
        Category::TextureParam,
        Category::TextureAssociation,
        Category::DeprecatedMaterial,
        Category::SurfaceGeometry,
        Category::SolidGeometry,
    ];

    /// Whether a record may depend on another unresolved record of the same category.
    pub fn is_recursive(self) -> bool {
        matches!(self, Category::GroupMember | Category::SurfaceGeometry)
    }

    /// Stable name used for staging tables and log output.
    pub fn name(self) -> &'static str {
        match self {
            Category::Basic => "basic",
            Category::GroupMember => "group_member",
            Category::TextureImage => "texture_image",
            Category::TextureCoordList => "texture_coord_list",
            Category::TextureParam => "texture_param",
            Category::TextureAssociation => "texture_association",
            Category::DeprecatedMaterial => "deprecated_material",
            Category::SurfaceGeometry => "surface_geometry",
            Category::SolidGeometry => "solid_geometry",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Link written into a column of an existing row or into a link table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicLink {
    /// Destination table.
    pub table: String,
    /// Owning row's id.
    pub id: i64,
    /// Link-table column receiving `id`; `None` updates `to_column` of row `id`.
    pub from_column: Option<String>,
    /// Column receiving the resolved target id.
    pub to_column: String,
    /// Value of the link table's `role` column.
    pub role: Option<String>,
    /// Swap the owner and the target in link-table inserts.
    pub reverse: bool,
    /// Target identifier.
    pub target: String,
}

/// Membership of a feature in a group, or the group's parent link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMembership {
    /// Group row id.
    pub group_id: i64,
    /// Member (or parent) identifier.
    pub target: String,
    /// Role of the member.
    pub role: Option<String>,
    /// Whether `target` is the group's parent rather than a member.
    pub is_parent: bool,
}

/// Image file whose bytes still have to be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureImageLoad {
    /// Image row id.
    pub image_id: i64,
    /// Location as written in the document.
    pub uri: String,
    /// Directory of the input file, for relative locations.
    pub base_dir: PathBuf,
}

/// Texture coordinates whose ring was not known yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TexCoordListLink {
    /// Texture row id.
    pub surface_data_id: i64,
    /// Ring identifier.
    pub ring: String,
    /// `s t` pairs.
    pub coords: Vec<f64>,
    /// Identifier of the enclosing parameterization.
    pub association: Option<String>,
}

/// Target of a texture parameterization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkTarget {
    /// Still symbolic.
    Symbolic(String),
    /// Already resolved to a geometry row id.
    Resolved(i64),
}

/// Parameterization row waiting for its surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureParamLink {
    /// Surface data row id.
    pub surface_data_id: i64,
    /// Textured surface.
    pub target: LinkTarget,
    /// Whether this is a texture parameterization (false for materials).
    pub is_texture: bool,
    /// Coordinates or transformation, JSON encoded.
    pub coordinates: Option<String>,
    /// Identifier of the parameterization, for reuse by other targets.
    pub association: Option<String>,
}

/// Parameterization reused by identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureAssociationLink {
    /// Surface data row id.
    pub surface_data_id: i64,
    /// Textured surface identifier.
    pub target: String,
    /// Identifier of the reused parameterization.
    pub association: String,
}

/// Legacy material link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialLink {
    /// Material identifier.
    pub material: String,
    /// Geometry identifier.
    pub target: String,
}

/// Geometry placeholder to be replaced by a copy of the target tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryLink {
    /// Placeholder row id.
    pub placeholder_id: i64,
    /// Parent of the placeholder.
    pub parent_id: Option<i64>,
    /// Root of the tree containing the placeholder.
    pub root_id: i64,
    /// Feature owning the tree.
    pub feature_id: i64,
    /// Whether the copied orientation is flipped.
    pub reverse: bool,
    /// Target geometry identifier.
    pub target: String,
}

/// Solid whose aggregated representation has to be rebuilt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolidRebuild {
    /// Solid row id.
    pub solid_id: i64,
}

/// Tagged deferred reference record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum DeferredRef {
    /// See [`BasicLink`].
    Basic(BasicLink),
    /// See [`GroupMembership`].
    GroupMember(GroupMembership),
    /// See [`TextureImageLoad`].
    TextureImage(TextureImageLoad),
    /// See [`TexCoordListLink`].
    TextureCoordList(TexCoordListLink),
    /// See [`TextureParamLink`].
    TextureParam(TextureParamLink),
    /// See [`TextureAssociationLink`].
    TextureAssociation(TextureAssociationLink),
    /// See [`MaterialLink`].
    DeprecatedMaterial(MaterialLink),
    /// See [`GeometryLink`].
    SurfaceGeometry(GeometryLink),
    /// See [`SolidRebuild`].
    SolidGeometry(SolidRebuild),
}

impl DeferredRef {
    /// Category of this record.
    pub fn category(&self) -> Category {
        match self {
            DeferredRef::Basic(_) => Category::Basic,
            DeferredRef::GroupMember(_) => Category::GroupMember,
            DeferredRef::TextureImage(_) => Category::TextureImage,
            DeferredRef::TextureCoordList(_) => Category::TextureCoordList,
            DeferredRef::TextureParam(_) => Category::TextureParam,
            DeferredRef::TextureAssociation(_) => Category::TextureAssociation,
            DeferredRef::DeprecatedMaterial(_) => Category::DeprecatedMaterial,
            DeferredRef::SurfaceGeometry(_) => Category::SurfaceGeometry,
            DeferredRef::SolidGeometry(_) => Category::SolidGeometry,
        }
    }

    /// Row that owns the reference; indexed in the store so recursive
    /// resolvers can ask whether a row still has pending records.
    pub fn owner_id(&self) -> i64 {
        match self {
            DeferredRef::Basic(link) => link.id,
            DeferredRef::GroupMember(link) => link.group_id,
            DeferredRef::TextureImage(link) => link.image_id,
            DeferredRef::TextureCoordList(link) => link.surface_data_id,
            DeferredRef::TextureParam(link) => link.surface_data_id,
            DeferredRef::TextureAssociation(link) => link.surface_data_id,
            DeferredRef::DeprecatedMaterial(_) => 0,
            DeferredRef::SurfaceGeometry(link) => link.placeholder_id,
            DeferredRef::SolidGeometry(link) => link.solid_id,
        }
    }

    /// Symbolic target, for log output.
    pub fn target(&self) -> &str {
        match self {
            DeferredRef::Basic(link) => &link.target,
            DeferredRef::GroupMember(link) => &link.target,
            DeferredRef::TextureImage(link) => &link.uri,
            DeferredRef::TextureCoordList(link) => &link.ring,
            DeferredRef::TextureParam(link) => match &link.target {
                LinkTarget::Symbolic(target) => target,
                LinkTarget::Resolved(_) => "<resolved>",
            },
            DeferredRef::TextureAssociation(link) => &link.association,
            DeferredRef::DeprecatedMaterial(link) => &link.material,
            DeferredRef::SurfaceGeometry(link) => &link.target,
            DeferredRef::SolidGeometry(_) => "<solid>",
        }
    }
}
