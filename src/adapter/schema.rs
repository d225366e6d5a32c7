//! Relational target schema.

pub(crate) const TABLES: &str = "
CREATE TABLE IF NOT EXISTS feature (
    id INTEGER PRIMARY KEY,
    gmlid TEXT,
    objectclass TEXT NOT NULL,
    toplevel INTEGER NOT NULL DEFAULT 0,
    parent_id INTEGER,
    root_id INTEGER,
    address_id INTEGER,
    group_parent_id INTEGER
);
CREATE TABLE IF NOT EXISTS feature_attribute (
    id INTEGER PRIMARY KEY,
    feature_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    value_text TEXT,
    value_num REAL
);
CREATE TABLE IF NOT EXISTS feature_reference (
    feature_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    target_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS group_member (
    group_id INTEGER NOT NULL,
    member_id INTEGER NOT NULL,
    role TEXT
);
CREATE TABLE IF NOT EXISTS surface_geometry (
    id INTEGER PRIMARY KEY,
    gmlid TEXT,
    parent_id INTEGER,
    root_id INTEGER NOT NULL,
    feature_id INTEGER NOT NULL,
    role TEXT,
    kind TEXT NOT NULL,
    is_xlink INTEGER NOT NULL DEFAULT 0,
    is_reverse INTEGER NOT NULL DEFAULT 0,
    geometry TEXT,
    solid_geometry TEXT
);
CREATE TABLE IF NOT EXISTS appearance (
    id INTEGER PRIMARY KEY,
    gmlid TEXT,
    theme TEXT,
    feature_id INTEGER
);
CREATE TABLE IF NOT EXISTS surface_data (
    id INTEGER PRIMARY KEY,
    gmlid TEXT,
    kind TEXT NOT NULL,
    tex_image_id INTEGER,
    diffuse TEXT
);
CREATE TABLE IF NOT EXISTS appear_to_surface_data (
    appearance_id INTEGER NOT NULL,
    surface_data_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS tex_image (
    id INTEGER PRIMARY KEY,
    uri TEXT NOT NULL,
    data BLOB,
    mime_type TEXT
);
CREATE TABLE IF NOT EXISTS textureparam (
    gmlid TEXT,
    surface_geometry_id INTEGER NOT NULL,
    surface_data_id INTEGER NOT NULL,
    is_texture_parametrization INTEGER NOT NULL,
    texture_coordinates TEXT
);
";

/// Secondary index managed around an import.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexDef {
    pub name: &'static str,
    pub table: &'static str,
    pub columns: &'static str,
}

pub(crate) const INDEXES: [IndexDef; 7] = [
    IndexDef {
        name: "idx_feature_gmlid",
        table: "feature",
        columns: "gmlid",
    },
    IndexDef {
        name: "idx_feature_root",
        table: "feature",
        columns: "root_id",
    },
    IndexDef {
        name: "idx_geometry_gmlid",
        table: "surface_geometry",
        columns: "gmlid",
    },
    IndexDef {
        name: "idx_geometry_parent",
        table: "surface_geometry",
        columns: "parent_id",
    },
    IndexDef {
        name: "idx_geometry_root",
        table: "surface_geometry",
        columns: "root_id",
    },
    IndexDef {
        name: "idx_geometry_feature",
        table: "surface_geometry",
        columns: "feature_id",
    },
    IndexDef {
        name: "idx_textureparam_gmlid",
        table: "textureparam",
        columns: "gmlid",
    },
];

impl IndexDef {
    pub(crate) fn create_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            self.name, self.table, self.columns
        )
    }

    pub(crate) fn drop_sql(&self) -> String {
        format!("DROP INDEX IF EXISTS {}", self.name)
    }
}
