#![allow(dead_code)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use cityload::model::{Geometry, GeometryMember, LinearRing, Property};
use cityload::{Feature, ImporterConfig, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cityload=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Configuration with every staging file inside `dir`.
pub fn config(dir: &Path) -> ImporterConfig {
    let mut config = ImporterConfig::for_database(dir.join("city.db"));
    config.cache.spill_dir = Some(dir.join("spill"));
    config.xlink.store_dir = Some(dir.join("xlinks"));
    config.workers.min = 1;
    config.workers.max = 4;
    config
}

pub fn write_features(path: &Path, features: &[Feature]) -> Result<PathBuf> {
    let mut out = BufWriter::new(File::create(path)?);
    for feature in features {
        serde_json::to_writer(&mut out, feature)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(path.to_path_buf())
}

pub fn open(config: &ImporterConfig) -> Connection {
    Connection::open(&config.database).expect("open target database")
}

pub fn feature_id(conn: &Connection, gml_id: &str) -> Option<i64> {
    conn.query_row("SELECT id FROM feature WHERE gmlid = ?1", [gml_id], |row| row.get(0))
        .optional()
        .expect("query feature")
}

pub fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).expect("count query")
}

pub fn reference(role: &str, href: &str) -> Property {
    Property::Reference {
        role: role.into(),
        href: href.into(),
    }
}

pub fn square(gml_id: &str, ring_id: Option<&str>, z: f64) -> Geometry {
    Geometry::Polygon {
        gml_id: Some(gml_id.into()),
        exterior: LinearRing {
            gml_id: ring_id.map(str::to_string),
            coords: vec![0.0, 0.0, z, 1.0, 0.0, z, 1.0, 1.0, z, 0.0, 1.0, z, 0.0, 0.0, z],
        },
        interiors: Vec::new(),
    }
}

pub fn inline(geometry: Geometry) -> GeometryMember {
    GeometryMember::Inline {
        geometry: Box::new(geometry),
    }
}

pub fn xlink(href: &str) -> GeometryMember {
    GeometryMember::Xlink {
        href: format!("#{href}"),
        reverse: false,
    }
}

/// In-memory log sink for assertions on emitted events.
#[derive(Clone, Default)]
pub struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    /// Runs `f` with this log installed as the calling thread's subscriber.
    pub fn capture<T>(&self, f: impl FnOnce() -> T) -> T {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("cityload=info"))
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }
}

impl Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
