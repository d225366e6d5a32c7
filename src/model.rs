//! Feature graph emitted by document readers.
//!
//! A [`Feature`] is one node of the city-model graph. Cross references are
//! expressed through symbolic `href` values that name another object's
//! `gml_id`; a leading `#` is accepted and ignored.

use serde::{Deserialize, Serialize};

/// Object class tag of city object groups.
pub const GROUP_CLASS: &str = "CityObjectGroup";

/// One converted graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Type tag, e.g. `Building` or `Address`.
    pub object_class: String,
    /// Symbolic identifier. Optional for nested features.
    #[serde(default)]
    pub gml_id: Option<String>,
    /// Whether this is a root object whose commit governs batching.
    #[serde(default)]
    pub top_level: bool,
    /// Typed properties in document order.
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl Feature {
    /// Creates a top-level feature.
    pub fn top_level(object_class: impl Into<String>, gml_id: impl Into<String>) -> Self {
        Self {
            object_class: object_class.into(),
            gml_id: Some(gml_id.into()),
            top_level: true,
            properties: Vec::new(),
        }
    }

    /// Creates a nested feature.
    pub fn nested(object_class: impl Into<String>, gml_id: Option<String>) -> Self {
        Self {
            object_class: object_class.into(),
            gml_id,
            top_level: false,
            properties: Vec::new(),
        }
    }

    /// Appends `property` and returns the feature.
    pub fn with(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// Whether this feature is a city object group.
    pub fn is_group(&self) -> bool {
        self.object_class == GROUP_CLASS
    }

    /// Identifier used in log messages.
    pub fn label(&self) -> &str {
        self.gml_id.as_deref().unwrap_or("<anonymous>")
    }
}

/// Typed property of a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Property {
    /// Scalar attribute.
    Attribute {
        /// Attribute name.
        name: String,
        /// Attribute value.
        value: AttributeValue,
    },
    /// Link to another feature by identifier.
    Reference {
        /// Property name, used to pick the destination column or link table.
        role: String,
        /// Target identifier.
        href: String,
    },
    /// Nested feature owned by this one.
    Child {
        /// Property name.
        role: String,
        /// Owned feature.
        feature: Box<Feature>,
    },
    /// Geometry tree.
    Geometry {
        /// Property name, e.g. `lod2Solid`.
        role: String,
        /// Root of the geometry tree.
        geometry: Geometry,
    },
    /// Local appearance.
    Appearance {
        /// Appearance data.
        appearance: Appearance,
    },
    /// Group member (only meaningful on groups).
    GroupMember {
        /// Optional role of the member inside the group.
        #[serde(default)]
        role: Option<String>,
        /// Member identifier.
        href: String,
    },
    /// Parent object of a group.
    GroupParent {
        /// Parent identifier.
        href: String,
    },
    /// Legacy material link between a material and a geometry.
    Material {
        /// Identifier of the material surface data.
        href: String,
        /// Identifier of the textured geometry.
        target: String,
    },
}

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// Text.
    Text(String),
}

/// Node of a geometry tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    /// Planar surface bounded by linear rings.
    Polygon {
        /// Symbolic identifier.
        #[serde(default)]
        gml_id: Option<String>,
        /// Outer boundary.
        exterior: LinearRing,
        /// Holes.
        #[serde(default)]
        interiors: Vec<LinearRing>,
    },
    /// Unordered surface collection.
    MultiSurface {
        /// Symbolic identifier.
        #[serde(default)]
        gml_id: Option<String>,
        /// Members.
        members: Vec<GeometryMember>,
    },
    /// Connected surface collection.
    CompositeSurface {
        /// Symbolic identifier.
        #[serde(default)]
        gml_id: Option<String>,
        /// Members.
        members: Vec<GeometryMember>,
    },
    /// Volume bounded by a shell.
    Solid {
        /// Symbolic identifier.
        #[serde(default)]
        gml_id: Option<String>,
        /// Outer shell.
        exterior: Box<GeometryMember>,
    },
}

impl Geometry {
    /// Symbolic identifier of this node.
    pub fn gml_id(&self) -> Option<&str> {
        match self {
            Geometry::Polygon { gml_id, .. }
            | Geometry::MultiSurface { gml_id, .. }
            | Geometry::CompositeSurface { gml_id, .. }
            | Geometry::Solid { gml_id, .. } => gml_id.as_deref(),
        }
    }

    /// Kind name stored in the geometry table.
    pub fn kind(&self) -> &'static str {
        match self {
            Geometry::Polygon { .. } => "polygon",
            Geometry::MultiSurface { .. } => "multi_surface",
            Geometry::CompositeSurface { .. } => "composite_surface",
            Geometry::Solid { .. } => "solid",
        }
    }
}

/// Inline geometry or a reference to geometry defined elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "member", rename_all = "snake_case")]
pub enum GeometryMember {
    /// Geometry defined in place.
    Inline {
        /// Member geometry.
        geometry: Box<Geometry>,
    },
    /// Geometry reused by identifier.
    Xlink {
        /// Target identifier.
        href: String,
        /// Whether the orientation of the reused geometry is flipped.
        #[serde(default)]
        reverse: bool,
    },
}

/// Closed ring of 3D coordinates (`x y z` triples, first equals last).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRing {
    /// Symbolic identifier; texture coordinates target rings.
    #[serde(default)]
    pub gml_id: Option<String>,
    /// Flat coordinate list.
    pub coords: Vec<f64>,
}

/// Appearance theme attached to a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appearance {
    /// Symbolic identifier.
    #[serde(default)]
    pub gml_id: Option<String>,
    /// Theme name.
    #[serde(default)]
    pub theme: Option<String>,
    /// Surface data members.
    #[serde(default)]
    pub surface_data: Vec<SurfaceDataMember>,
}

/// Inline surface data or a reference to surface data defined elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "member", rename_all = "snake_case")]
pub enum SurfaceDataMember {
    /// Surface data defined in place.
    Inline {
        /// Surface data.
        surface_data: SurfaceData,
    },
    /// Surface data reused by identifier.
    Xlink {
        /// Target identifier.
        href: String,
    },
}

/// Texture or material applied to geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceData {
    /// Symbolic identifier.
    #[serde(default)]
    pub gml_id: Option<String>,
    /// Texture or material specifics.
    pub kind: SurfaceDataKind,
}

/// Surface data variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SurfaceDataKind {
    /// Image texture mapped onto surfaces.
    ParameterizedTexture {
        /// Image location, relative to the input file.
        image_uri: String,
        /// Textured surfaces.
        #[serde(default)]
        targets: Vec<TextureTarget>,
    },
    /// Plain material.
    X3dMaterial {
        /// Diffuse color.
        #[serde(default)]
        diffuse_color: Option<[f64; 3]>,
        /// Identifiers of the surfaces the material applies to.
        #[serde(default)]
        targets: Vec<String>,
    },
}

/// Surface textured by a parameterized texture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureTarget {
    /// Identifier of the textured surface.
    pub uri: String,
    /// How texture space maps onto the surface.
    pub parameterization: TextureParameterization,
}

/// Texture parameterization variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "param", rename_all = "snake_case")]
pub enum TextureParameterization {
    /// Explicit coordinates per ring.
    TexCoordList {
        /// Symbolic identifier; other targets may reuse this parameterization.
        #[serde(default)]
        gml_id: Option<String>,
        /// Coordinates per ring.
        rings: Vec<TexCoordRing>,
    },
    /// Coordinates generated from a world-to-texture transformation.
    TexCoordGen {
        /// Symbolic identifier.
        #[serde(default)]
        gml_id: Option<String>,
        /// Row-major 3x4 matrix.
        world_to_texture: Vec<f64>,
    },
    /// Parameterization reused by identifier.
    Xlink {
        /// Identifier of a `TexCoordList` or `TexCoordGen`.
        href: String,
    },
}

/// Texture coordinates of one ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TexCoordRing {
    /// Identifier of the ring.
    pub ring: String,
    /// Flat `s t` pairs.
    pub coords: Vec<f64>,
}

/// Strips the fragment marker from an `href`.
pub fn strip_href(href: &str) -> &str {
    href.trim().trim_start_matches('#')
}

/// Target identifier of a reference into the current document, or `None`
/// for references to other documents or remote resources.
pub fn local_target(href: &str) -> Option<&str> {
    let target = strip_href(href);
    if target.is_empty() || target.contains("://") || target.contains('#') {
        None
    } else {
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_json_shape() {
        let line = r##"{"object_class":"Building","gml_id":"bldg_1","top_level":true,
            "properties":[
              {"kind":"attribute","name":"storeys","value":3},
              {"kind":"reference","role":"address","href":"#addr_9"},
              {"kind":"geometry","role":"lod2MultiSurface","geometry":
                {"type":"multi_surface","members":[
                  {"member":"xlink","href":"#poly_1","reverse":true},
                  {"member":"inline","geometry":{"type":"polygon","gml_id":"poly_2",
                    "exterior":{"coords":[0,0,0,1,0,0,1,1,0,0,0,0]}}}]}}]}"##;
        let feature: Feature = serde_json::from_str(line).unwrap();
        assert_eq!(feature.label(), "bldg_1");
        assert!(feature.top_level);
        assert_eq!(
            feature.properties[0],
            Property::Attribute {
                name: "storeys".into(),
                value: AttributeValue::Int(3)
            }
        );
        match &feature.properties[2] {
            Property::Geometry { geometry, .. } => assert_eq!(geometry.kind(), "multi_surface"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn href_fragment_is_stripped() {
        assert_eq!(strip_href("#addr_9"), "addr_9");
        assert_eq!(strip_href(" addr_9 "), "addr_9");
    }

    #[test]
    fn remote_references_are_not_local() {
        assert_eq!(local_target("#poly_1"), Some("poly_1"));
        assert_eq!(local_target("other.gml#poly_1"), None);
        assert_eq!(local_target("https://example.org/city#b1"), None);
        assert_eq!(local_target("#"), None);
    }
}
