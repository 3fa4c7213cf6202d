use crate::crs::Crs;
use anyhow::{anyhow, bail, Context, Result};
use geo::Geometry;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::path::Path;

// cf. https://www.geopackage.org/spec140/index.html#table_definition_sql

const SQL_GPKG_SPATIAL_REF_SYS: &str = "
CREATE TABLE gpkg_spatial_ref_sys (
  srs_name TEXT NOT NULL,
  srs_id INTEGER PRIMARY KEY,
  organization TEXT NOT NULL,
  organization_coordsys_id INTEGER NOT NULL,
  definition  TEXT NOT NULL,
  description TEXT
);
";

const SQL_GPKG_CONTENTS: &str = "
CREATE TABLE gpkg_contents (
  table_name TEXT NOT NULL PRIMARY KEY,
  data_type TEXT NOT NULL,
  identifier TEXT UNIQUE,
  description TEXT DEFAULT '',
  last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
  min_x DOUBLE,
  min_y DOUBLE,
  max_x DOUBLE,
  max_y DOUBLE,
  srs_id INTEGER,
  CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
";

const SQL_GPKG_GEOMETRY_COLUMNS: &str = "
CREATE TABLE gpkg_geometry_columns (
  table_name TEXT NOT NULL,
  column_name TEXT NOT NULL,
  geometry_type_name TEXT NOT NULL,
  srs_id INTEGER NOT NULL,
  z TINYINT NOT NULL,
  m TINYINT NOT NULL,
  CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
  CONSTRAINT uk_gc_table_name UNIQUE (table_name),
  CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
  CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys (srs_id)
);
";

const SQL_INSERT_CONTENTS: &str = "
INSERT INTO gpkg_contents
  (table_name, data_type, identifier, description, srs_id)
VALUES
  (?1, 'features', ?2, '', ?3)
";

const SQL_INSERT_GEOMETRY_COLUMNS: &str = "
INSERT INTO gpkg_geometry_columns
  (table_name, column_name, geometry_type_name, srs_id, z, m)
VALUES
  (?1, ?2, ?3, ?4, 0, 0)
";

const GEOMETRY_COLUMN: &str = "geom";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
}

impl ColumnKind {
    fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Text => "TEXT",
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Real => "REAL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    Point,
    MultiPolygon,
}

impl GeometryKind {
    fn type_name(&self) -> &'static str {
        match self {
            GeometryKind::Point => "POINT",
            GeometryKind::MultiPolygon => "MULTIPOLYGON",
        }
    }
}

/// A property value headed for a layer column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Null,
}

impl FieldValue {
    fn as_sql(&self) -> rusqlite::types::Value {
        match self {
            FieldValue::Text(s) => rusqlite::types::Value::Text(s.clone()),
            FieldValue::Integer(i) => rusqlite::types::Value::Integer(*i),
            FieldValue::Real(r) => rusqlite::types::Value::Real(*r),
            FieldValue::Null => rusqlite::types::Value::Null,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Real(value)
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(s) => FieldValue::Text(s),
            None => FieldValue::Null,
        }
    }
}

/// Schema of one output layer.
#[derive(Debug, Clone)]
pub struct LayerDef {
    pub name: String,
    pub geometry: GeometryKind,
    pub crs: Crs,
    pub columns: Vec<ColumnSpec>,
}

/// One feature headed for a layer: a geometry plus ordered property
/// values matching the layer columns. Geometry is optional only so that
/// the writer can reject geometry-less tables itself.
#[derive(Debug, Clone)]
pub struct FeatureRow {
    pub geometry: Option<Geometry<f64>>,
    pub values: Vec<FieldValue>,
}

/// GeoPackage container: multiple named feature layers in one SQLite
/// file.
#[derive(Debug)]
pub struct GeoPackage {
    conn: Connection,
}

impl GeoPackage {
    /// Open an existing container, or initialize a fresh one at `path`.
    /// Overwrite semantics live at the layer level, so an existing
    /// container is never truncated here.
    pub fn create_or_open(path: &Path) -> Result<Self> {
        let existed = path.exists();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open GeoPackage: {:?}", path))?;

        if existed {
            ensure_geopackage(&conn)?;
        } else {
            initialize(&conn)
                .with_context(|| format!("Failed to initialize GeoPackage: {:?}", path))?;
        }

        Ok(Self { conn })
    }

    /// Inspection-only handle; any write through it fails at the SQLite
    /// level.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("GeoPackage file does not exist: {:?}", path);
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("Failed to open GeoPackage: {:?}", path))?;
        ensure_geopackage(&conn)?;
        Ok(Self { conn })
    }

    /// List the names of the layers.
    pub fn list_layers(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT table_name FROM gpkg_contents ORDER BY table_name")?;
        let layers = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(layers)
    }

    pub fn feature_count(&self, layer: &str) -> Result<i64> {
        if !self.layer_exists(layer)? {
            bail!("No such layer: {}", layer);
        }
        let count = self
            .conn
            .query_row(&format!(r#"SELECT COUNT(*) FROM "{}""#, layer), [], |row| {
                row.get(0)
            })?;
        Ok(count)
    }

    /// Persist `rows` as the named layer. With `overwrite`, an existing
    /// layer of the same name is dropped and re-registered first; other
    /// layers in the container are untouched. Every row must carry a
    /// geometry and exactly one value per declared column.
    pub fn write_layer(
        &mut self,
        def: &LayerDef,
        rows: &[FeatureRow],
        overwrite: bool,
    ) -> Result<usize> {
        // validate everything before touching the container
        for (idx, row) in rows.iter().enumerate() {
            if row.geometry.is_none() {
                bail!(
                    "Layer '{}': feature {} has no geometry; only geometric tables can be written",
                    def.name,
                    idx
                );
            }
            if row.values.len() != def.columns.len() {
                bail!(
                    "Layer '{}': feature {} has {} values for {} columns",
                    def.name,
                    idx,
                    row.values.len(),
                    def.columns.len()
                );
            }
        }

        if self.layer_exists(&def.name)? {
            if !overwrite {
                bail!("Layer already exists: {}", def.name);
            }
            self.delete_layer(&def.name)?;
        }

        let mut column_defs = Vec::with_capacity(def.columns.len() + 2);
        column_defs.push("fid INTEGER PRIMARY KEY AUTOINCREMENT".to_string());
        column_defs.push(format!(r#""{}" BLOB"#, GEOMETRY_COLUMN));
        for spec in &def.columns {
            column_defs.push(format!(r#""{}" {}"#, spec.name, spec.kind.sql_type()));
        }
        self.conn.execute(
            &format!(r#"CREATE TABLE "{}" ({})"#, def.name, column_defs.join(", ")),
            [],
        )?;
        self.conn.execute(
            SQL_INSERT_CONTENTS,
            params![def.name, def.name, def.crs.epsg()],
        )?;
        self.conn.execute(
            SQL_INSERT_GEOMETRY_COLUMNS,
            params![
                def.name,
                GEOMETRY_COLUMN,
                def.geometry.type_name(),
                def.crs.epsg()
            ],
        )?;

        let insert_sql = build_insert_sql(def);
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&insert_sql)?;
            for row in rows {
                let geometry = row
                    .geometry
                    .as_ref()
                    .ok_or_else(|| anyhow!("Layer '{}': feature without geometry", def.name))?;
                let blob = geometry_blob(geometry, def.crs)?;

                let mut values = Vec::with_capacity(row.values.len() + 1);
                values.push(rusqlite::types::Value::Blob(blob));
                values.extend(row.values.iter().map(FieldValue::as_sql));
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;

        Ok(rows.len())
    }

    fn layer_exists(&self, name: &str) -> Result<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM gpkg_contents WHERE table_name = ?1)",
            params![name],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    fn delete_layer(&self, name: &str) -> Result<()> {
        self.conn
            .execute(&format!(r#"DROP TABLE IF EXISTS "{}""#, name), [])?;
        self.conn.execute(
            "DELETE FROM gpkg_geometry_columns WHERE table_name = ?1",
            params![name],
        )?;
        self.conn.execute(
            "DELETE FROM gpkg_contents WHERE table_name = ?1",
            params![name],
        )?;
        Ok(())
    }
}

fn build_insert_sql(def: &LayerDef) -> String {
    let mut columns = Vec::with_capacity(def.columns.len() + 1);
    columns.push(format!(r#""{}""#, GEOMETRY_COLUMN));
    columns.extend(def.columns.iter().map(|spec| format!(r#""{}""#, spec.name)));

    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<String>>()
        .join(",");

    format!(
        r#"INSERT INTO "{}" ({}) VALUES ({})"#,
        def.name,
        columns.join(","),
        placeholders
    )
}

// cf. https://www.geopackage.org/spec140/index.html#gpb_format
fn geometry_blob<G>(geometry: &G, crs: Crs) -> Result<Vec<u8>>
where
    G: geo_traits::GeometryTrait<T = f64>,
{
    let mut wkb_bytes = Vec::new();
    wkb::writer::write_geometry(&mut wkb_bytes, geometry, &Default::default())
        .map_err(|e| anyhow!("Failed to encode geometry as WKB: {e}"))?;

    let mut blob = Vec::with_capacity(wkb_bytes.len() + 8);
    blob.extend_from_slice(&[
        0x47u8, // magic
        0x50u8, // magic
        0x00u8, // version
        0x01u8, // flags (little endian SRS id, no envelope)
    ]);
    blob.extend_from_slice(&crs.epsg().to_le_bytes());
    blob.extend_from_slice(&wkb_bytes);
    Ok(blob)
}

fn ensure_geopackage(conn: &Connection) -> Result<()> {
    let has_contents: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'gpkg_contents')",
        [],
        |row| row.get(0),
    )?;
    if has_contents == 0 {
        bail!("Not a GeoPackage: gpkg_contents table is missing");
    }
    Ok(())
}

fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA application_id = 0x47504B47; PRAGMA user_version = 10300;")?;
    conn.execute_batch(SQL_GPKG_SPATIAL_REF_SYS)?;
    conn.execute_batch(SQL_GPKG_CONTENTS)?;
    conn.execute_batch(SQL_GPKG_GEOMETRY_COLUMNS)?;
    register_default_srs(conn)?;
    Ok(())
}

fn register_default_srs(conn: &Connection) -> Result<()> {
    let sql = "INSERT INTO gpkg_spatial_ref_sys \
            (srs_name, srs_id, organization, organization_coordsys_id, definition, description) \
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

    // the two placeholder systems the spec requires in every container
    conn.execute(
        sql,
        params![
            "Undefined Cartesian SRS",
            -1,
            "NONE",
            -1,
            "undefined",
            "undefined Cartesian coordinate reference system"
        ],
    )?;
    conn.execute(
        sql,
        params![
            "Undefined geographic SRS",
            0,
            "NONE",
            0,
            "undefined",
            "undefined geographic coordinate reference system"
        ],
    )?;

    for crs in [Crs::Wgs84, Crs::BritishNationalGrid] {
        conn.execute(
            sql,
            params![crs.name(), crs.epsg(), "EPSG", crs.epsg(), crs.wkt(), crs.name()],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, LineString, MultiPolygon, Polygon};
    use std::path::PathBuf;

    fn temp_gpkg(name: &str) -> PathBuf {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        std::env::temp_dir().join(format!("cyclemap_{nanos}_{name}.gpkg"))
    }

    fn point_layer(name: &str) -> LayerDef {
        LayerDef {
            name: name.to_string(),
            geometry: GeometryKind::Point,
            crs: Crs::BritishNationalGrid,
            columns: vec![ColumnSpec::new("name", ColumnKind::Text)],
        }
    }

    fn point_row(x: f64, y: f64, name: &str) -> FeatureRow {
        FeatureRow {
            geometry: Some(Geometry::Point(point!(x: x, y: y))),
            values: vec![FieldValue::from(name)],
        }
    }

    fn polygon_row() -> FeatureRow {
        let square = Polygon::new(
            LineString::from(vec![
                (0.0, 0.0),
                (100.0, 0.0),
                (100.0, 100.0),
                (0.0, 100.0),
                (0.0, 0.0),
            ]),
            vec![],
        );
        FeatureRow {
            geometry: Some(Geometry::MultiPolygon(MultiPolygon::new(vec![square]))),
            values: vec![FieldValue::from("Test Borough")],
        }
    }

    #[test]
    fn writes_three_layers_and_lists_them() {
        let path = temp_gpkg("three_layers");
        {
            let mut gpkg = GeoPackage::create_or_open(&path).unwrap();

            let polygons = LayerDef {
                name: "boroughs_stats".to_string(),
                geometry: GeometryKind::MultiPolygon,
                crs: Crs::BritishNationalGrid,
                columns: vec![ColumnSpec::new("name", ColumnKind::Text)],
            };
            gpkg.write_layer(&polygons, &[polygon_row()], false).unwrap();
            gpkg.write_layer(
                &point_layer("borough_centroids_stats"),
                &[point_row(50.0, 50.0, "Test Borough")],
                false,
            )
            .unwrap();
            gpkg.write_layer(
                &point_layer("stations_stats"),
                &[
                    point_row(10.0, 10.0, "a"),
                    point_row(20.0, 20.0, "b"),
                ],
                false,
            )
            .unwrap();
        }

        let gpkg = GeoPackage::open_read_only(&path).unwrap();
        assert_eq!(
            gpkg.list_layers().unwrap(),
            vec![
                "borough_centroids_stats".to_string(),
                "boroughs_stats".to_string(),
                "stations_stats".to_string()
            ]
        );
        assert_eq!(gpkg.feature_count("stations_stats").unwrap(), 2);
        assert_eq!(gpkg.feature_count("boroughs_stats").unwrap(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn overwrite_replaces_one_layer_only() {
        let path = temp_gpkg("overwrite");
        let mut gpkg = GeoPackage::create_or_open(&path).unwrap();

        gpkg.write_layer(
            &point_layer("stations"),
            &[point_row(1.0, 1.0, "a"), point_row(2.0, 2.0, "b")],
            false,
        )
        .unwrap();
        gpkg.write_layer(&point_layer("other"), &[point_row(9.0, 9.0, "z")], false)
            .unwrap();

        gpkg.write_layer(&point_layer("stations"), &[point_row(3.0, 3.0, "c")], true)
            .unwrap();

        assert_eq!(gpkg.list_layers().unwrap(), vec!["other", "stations"]);
        assert_eq!(gpkg.feature_count("stations").unwrap(), 1);
        assert_eq!(gpkg.feature_count("other").unwrap(), 1);

        let registered: i64 = gpkg
            .conn
            .query_row(
                "SELECT COUNT(*) FROM gpkg_geometry_columns WHERE table_name = 'stations'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(registered, 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn existing_layer_without_overwrite_is_an_error() {
        let path = temp_gpkg("no_overwrite");
        let mut gpkg = GeoPackage::create_or_open(&path).unwrap();
        gpkg.write_layer(&point_layer("stations"), &[point_row(1.0, 1.0, "a")], false)
            .unwrap();

        let err = gpkg
            .write_layer(&point_layer("stations"), &[point_row(2.0, 2.0, "b")], false)
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn geometryless_rows_are_rejected() {
        let path = temp_gpkg("no_geom");
        let mut gpkg = GeoPackage::create_or_open(&path).unwrap();

        let row = FeatureRow {
            geometry: None,
            values: vec![FieldValue::from("a")],
        };
        let err = gpkg
            .write_layer(&point_layer("stations"), &[row], false)
            .unwrap_err();
        assert!(err.to_string().contains("no geometry"), "{err}");
        // nothing half-written
        assert!(gpkg.list_layers().unwrap().is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn mismatched_value_count_is_rejected() {
        let path = temp_gpkg("bad_values");
        let mut gpkg = GeoPackage::create_or_open(&path).unwrap();

        let row = FeatureRow {
            geometry: Some(Geometry::Point(point!(x: 1.0, y: 1.0))),
            values: vec![],
        };
        let err = gpkg
            .write_layer(&point_layer("stations"), &[row], false)
            .unwrap_err();
        assert!(err.to_string().contains("0 values for 1 columns"), "{err}");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reopening_a_container_keeps_existing_layers() {
        let path = temp_gpkg("reopen");
        {
            let mut gpkg = GeoPackage::create_or_open(&path).unwrap();
            gpkg.write_layer(&point_layer("first"), &[point_row(1.0, 1.0, "a")], false)
                .unwrap();
        }
        {
            let mut gpkg = GeoPackage::create_or_open(&path).unwrap();
            gpkg.write_layer(&point_layer("second"), &[point_row(2.0, 2.0, "b")], false)
                .unwrap();
            assert_eq!(gpkg.list_layers().unwrap(), vec!["first", "second"]);
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn open_read_only_requires_an_existing_file() {
        let err = GeoPackage::open_read_only(Path::new("/tmp/definitely_missing.gpkg"))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn a_plain_sqlite_file_is_not_a_geopackage() {
        let path = temp_gpkg("plain");
        std::fs::write(&path, []).unwrap();

        let err = GeoPackage::open_read_only(&path).unwrap_err();
        assert!(err.to_string().contains("Not a GeoPackage"), "{err}");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unknown_layer_count_is_an_error() {
        let path = temp_gpkg("unknown_layer");
        let gpkg = GeoPackage::create_or_open(&path).unwrap();
        assert!(gpkg.feature_count("nope").is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn geometry_blob_carries_the_gpkg_header_and_srs() {
        let blob = geometry_blob(
            &Geometry::Point(point!(x: 3.0, y: -1.0)),
            Crs::BritishNationalGrid,
        )
        .unwrap();
        assert_eq!(&blob[0..4], &[0x47, 0x50, 0x00, 0x01]);
        assert_eq!(i32::from_le_bytes(blob[4..8].try_into().unwrap()), 27700);
        assert!(blob.len() > 8);
    }
}
