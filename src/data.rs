use crate::crs::Crs;
use crate::types::{Borough, FeatureSet, Station};
use anyhow::{anyhow, bail, Context, Result};
use geo::{MultiPolygon, Point};
use geojson::{GeoJson, JsonObject};
use std::collections::HashSet;
use std::convert::TryInto;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Generalized borough boundaries, compiled into the binary so the
/// pipeline needs no path for them.
const BOROUGHS_GEOJSON: &str = include_str!("../data/london_boroughs.geojson");

/// Source data is geographic lon/lat.
const SOURCE_CRS: Crs = Crs::Wgs84;

pub fn load_stations(path: &Path) -> Result<FeatureSet<Station>> {
    println!("Loading stations from {:?}...", path);

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| anyhow!("Station file has no extension: {:?}", path))?;

    let stations = match extension.as_str() {
        "json" | "geojson" => load_stations_geojson(path)?,
        "shp" => load_stations_shapefile(path)?,
        _ => bail!("Unsupported station format: {}", extension),
    };

    println!("Loaded {} stations", stations.len());
    Ok(FeatureSet::new(stations, SOURCE_CRS))
}

fn load_stations_geojson(path: &Path) -> Result<Vec<Station>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open station file: {:?}", path))?;
    let reader = BufReader::new(file);

    // Parses the whole file into memory; station files are small.
    let geojson = GeoJson::from_reader(reader).context("Failed to parse station GeoJSON")?;
    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => bail!("Station GeoJSON must be a FeatureCollection"),
    };

    let mut stations = Vec::with_capacity(collection.features.len());

    for (idx, feature) in collection.features.into_iter().enumerate() {
        let props = feature
            .properties
            .as_ref()
            .ok_or_else(|| anyhow!("Station feature {} has no properties", idx))?;

        let id = require_i64(props, "id")?;
        let geometry = feature
            .geometry
            .ok_or_else(|| anyhow!("Station {} has no geometry", id))?;
        let geo_geom: geo::Geometry<f64> = geometry
            .value
            .try_into()
            .map_err(|e| anyhow!("Station {} has malformed geometry: {:?}", id, e))?;
        let point = match geo_geom {
            geo::Geometry::Point(p) => p,
            other => bail!(
                "Station {} must be a Point, found {:?}",
                id,
                geometry_kind(&other)
            ),
        };

        let bikes = require_u32(props, "nbikes")?;
        let empty_slots = require_u32(props, "nempty")?;
        stations.push(Station {
            id,
            name: require_str(props, "name")?,
            area: require_str(props, "area")?,
            bikes,
            empty_slots,
            total_slots: bikes + empty_slots,
            point,
            borough: None,
        });
    }

    Ok(stations)
}

fn load_stations_shapefile(path: &Path) -> Result<Vec<Station>> {
    let mut reader = shapefile::Reader::from_path(path)
        .with_context(|| format!("Failed to open station Shapefile: {:?}", path))?;

    let mut stations = Vec::new();

    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result?;

        let point = match shape {
            shapefile::Shape::Point(p) => Point::new(p.x, p.y),
            shapefile::Shape::PointM(p) => Point::new(p.x, p.y),
            shapefile::Shape::PointZ(p) => Point::new(p.x, p.y),
            _ => bail!("Station shapefile must contain point shapes"),
        };

        let bikes = dbase_u32(&record, "nbikes")?;
        let empty_slots = dbase_u32(&record, "nempty")?;
        stations.push(Station {
            id: dbase_i64(&record, "id")?,
            name: dbase_string(&record, "name")?,
            area: dbase_string(&record, "area")?,
            bikes,
            empty_slots,
            total_slots: bikes + empty_slots,
            point,
            borough: None,
        });
    }

    Ok(stations)
}

/// Load the packaged borough polygons. No path argument: the dataset is
/// an in-memory resource.
pub fn load_boroughs() -> Result<FeatureSet<Borough>> {
    println!("Loading packaged borough boundaries...");

    let geojson: GeoJson = BOROUGHS_GEOJSON
        .parse()
        .context("Failed to parse packaged borough GeoJSON")?;
    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => bail!("Packaged borough data must be a FeatureCollection"),
    };

    let mut seen_codes = HashSet::new();
    let mut boroughs = Vec::with_capacity(collection.features.len());

    for feature in collection.features {
        let props = feature
            .properties
            .as_ref()
            .ok_or_else(|| anyhow!("Borough feature has no properties"))?;
        let gss_code = require_str(props, "gss_code")?;

        if !seen_codes.insert(gss_code.clone()) {
            bail!("Duplicate borough code: {}", gss_code);
        }

        let geometry = feature
            .geometry
            .ok_or_else(|| anyhow!("Borough {} has no geometry", gss_code))?;
        let geo_geom: geo::Geometry<f64> = geometry
            .value
            .try_into()
            .map_err(|e| anyhow!("Borough {} has malformed geometry: {:?}", gss_code, e))?;
        let boundary = match geo_geom {
            geo::Geometry::MultiPolygon(mp) => mp,
            geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
            other => bail!(
                "Borough {} must be a (Multi)Polygon, found {:?}",
                gss_code,
                geometry_kind(&other)
            ),
        };

        let ons_inner = match require_str(props, "ons_inner")?.as_str() {
            "T" => true,
            "F" => false,
            other => bail!("Borough {}: ons_inner must be T or F, found {:?}", gss_code, other),
        };

        boroughs.push(Borough {
            name: require_str(props, "name")?,
            gss_code,
            hectares: require_f64(props, "hectares")?,
            nonld_area: require_f64(props, "nonld_area")?,
            ons_inner,
            sub_2006: optional_str(props, "sub_2006"),
            sub_2009: optional_str(props, "sub_2009"),
            boundary,
        });
    }

    println!("Loaded {} boroughs", boroughs.len());
    Ok(FeatureSet::new(boroughs, SOURCE_CRS))
}

/// Recompute the derived capacity column. The total is not stored
/// independently anywhere, so this is the one place that defines it.
pub fn recompute_total_slots(stations: &mut FeatureSet<Station>) {
    for station in &mut stations.features {
        station.total_slots = station.bikes + station.empty_slots;
    }
}

fn geometry_kind(geom: &geo::Geometry<f64>) -> &'static str {
    match geom {
        geo::Geometry::Point(_) => "Point",
        geo::Geometry::Line(_) => "Line",
        geo::Geometry::LineString(_) => "LineString",
        geo::Geometry::Polygon(_) => "Polygon",
        geo::Geometry::MultiPoint(_) => "MultiPoint",
        geo::Geometry::MultiLineString(_) => "MultiLineString",
        geo::Geometry::MultiPolygon(_) => "MultiPolygon",
        geo::Geometry::GeometryCollection(_) => "GeometryCollection",
        geo::Geometry::Rect(_) => "Rect",
        geo::Geometry::Triangle(_) => "Triangle",
    }
}

fn require_value<'a>(props: &'a JsonObject, key: &str) -> Result<&'a serde_json::Value> {
    props
        .get(key)
        .ok_or_else(|| anyhow!("Missing property '{}'", key))
}

fn require_str(props: &JsonObject, key: &str) -> Result<String> {
    match require_value(props, key)? {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(anyhow!("Property '{}' must be a string, found {}", key, other)),
    }
}

fn optional_str(props: &JsonObject, key: &str) -> Option<String> {
    match props.get(key) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn require_f64(props: &JsonObject, key: &str) -> Result<f64> {
    require_value(props, key)?
        .as_f64()
        .ok_or_else(|| anyhow!("Property '{}' must be a number", key))
}

fn require_i64(props: &JsonObject, key: &str) -> Result<i64> {
    require_value(props, key)?
        .as_i64()
        .ok_or_else(|| anyhow!("Property '{}' must be an integer", key))
}

fn require_u32(props: &JsonObject, key: &str) -> Result<u32> {
    let value = require_i64(props, key)?;
    u32::try_from(value).map_err(|_| anyhow!("Property '{}' out of range: {}", key, value))
}

fn dbase_string(record: &shapefile::dbase::Record, field: &str) -> Result<String> {
    match record.get(field) {
        Some(shapefile::dbase::FieldValue::Character(Some(s))) => Ok(s.clone()),
        Some(shapefile::dbase::FieldValue::Character(None)) | None => {
            Err(anyhow!("Missing field '{}' in shapefile record", field))
        }
        Some(_) => Err(anyhow!("Field '{}' must be a string", field)),
    }
}

fn dbase_f64(record: &shapefile::dbase::Record, field: &str) -> Result<f64> {
    match record.get(field) {
        Some(shapefile::dbase::FieldValue::Numeric(Some(n))) => Ok(*n),
        Some(shapefile::dbase::FieldValue::Integer(n)) => Ok(f64::from(*n)),
        Some(shapefile::dbase::FieldValue::Numeric(None)) | None => {
            Err(anyhow!("Missing field '{}' in shapefile record", field))
        }
        Some(_) => Err(anyhow!("Field '{}' must be numeric", field)),
    }
}

fn dbase_i64(record: &shapefile::dbase::Record, field: &str) -> Result<i64> {
    Ok(dbase_f64(record, field)? as i64)
}

fn dbase_u32(record: &shapefile::dbase::Record, field: &str) -> Result<u32> {
    let value = dbase_i64(record, field)?;
    u32::try_from(value).map_err(|_| anyhow!("Field '{}' out of range: {}", field, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> std::path::PathBuf {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        std::env::temp_dir().join(format!("cyclemap_{nanos}_{name}"))
    }

    #[test]
    fn packaged_boroughs_load_cleanly() {
        let boroughs = load_boroughs().unwrap();
        assert_eq!(boroughs.len(), 33);
        assert_eq!(boroughs.crs, Crs::Wgs84);

        let codes: HashSet<&str> = boroughs
            .features
            .iter()
            .map(|b| b.gss_code.as_str())
            .collect();
        assert_eq!(codes.len(), 33);

        for borough in &boroughs.features {
            assert!(borough.hectares > 0.0, "{}", borough.gss_code);
            assert!(borough.sub_2006.is_none());
            assert!(borough.sub_2009.is_none());
        }
        let inner = boroughs.features.iter().filter(|b| b.ons_inner).count();
        assert_eq!(inner, 12);
    }

    #[test]
    fn sample_stations_load_cleanly() {
        let stations = load_stations(Path::new("data/cycle_hire.geojson")).unwrap();
        assert_eq!(stations.len(), 46);
        assert_eq!(stations.crs, Crs::Wgs84);
        for station in &stations.features {
            assert_eq!(station.total_slots, station.bikes + station.empty_slots);
            assert!(station.borough.is_none());
        }
    }

    #[test]
    fn recompute_keeps_the_derived_column_consistent() {
        let mut stations = load_stations(Path::new("data/cycle_hire.geojson")).unwrap();
        stations.features[0].bikes += 5;
        recompute_total_slots(&mut stations);
        for station in &stations.features {
            assert_eq!(station.total_slots, station.bikes + station.empty_slots);
        }
    }

    #[test]
    fn missing_file_is_a_load_error() {
        assert!(load_stations(Path::new("data/nope.geojson")).is_err());
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = load_stations(Path::new("data/stations.csv")).unwrap_err();
        assert!(err.to_string().contains("Unsupported station format"));
    }

    #[test]
    fn non_point_station_geometry_is_a_load_error() {
        let path = temp_path("bad_geom.geojson");
        let mut file = File::create(&path).unwrap();
        file.write_all(
            br#"{"type":"FeatureCollection","features":[{"type":"Feature",
                "properties":{"id":1,"name":"x","area":"y","nbikes":1,"nempty":2},
                "geometry":{"type":"LineString","coordinates":[[0,51],[1,52]]}}]}"#,
        )
        .unwrap();

        let err = load_stations(&path).unwrap_err();
        assert!(err.to_string().contains("must be a Point"), "{err}");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_station_property_is_a_load_error() {
        let path = temp_path("bad_props.geojson");
        let mut file = File::create(&path).unwrap();
        file.write_all(
            br#"{"type":"FeatureCollection","features":[{"type":"Feature",
                "properties":{"id":1,"name":"x","area":"y","nbikes":1},
                "geometry":{"type":"Point","coordinates":[0,51]}}]}"#,
        )
        .unwrap();

        let err = load_stations(&path).unwrap_err();
        assert!(err.to_string().contains("nempty"), "{err}");
        let _ = std::fs::remove_file(&path);
    }
}
