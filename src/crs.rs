use anyhow::{bail, Result};
use geo::{Coord, MapCoords};

use crate::types::{Borough, FeatureSet, Station};

/// Coordinate reference systems this pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// Geographic lon/lat on WGS84 (EPSG:4326).
    Wgs84,
    /// OSGB36 / British National Grid, metres (EPSG:27700).
    BritishNationalGrid,
}

impl Crs {
    pub fn from_epsg(code: i32) -> Result<Self> {
        match code {
            4326 => Ok(Crs::Wgs84),
            27700 => Ok(Crs::BritishNationalGrid),
            _ => bail!("Unknown CRS code: EPSG:{}", code),
        }
    }

    pub fn epsg(&self) -> i32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::BritishNationalGrid => 27700,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Crs::Wgs84 => "WGS 84",
            Crs::BritishNationalGrid => "OSGB36 / British National Grid",
        }
    }

    /// Well-known text definition, as registered in GeoPackage SRS tables.
    pub fn wkt(&self) -> &'static str {
        match self {
            Crs::Wgs84 => WGS84_WKT,
            Crs::BritishNationalGrid => BNG_WKT,
        }
    }
}

const WGS84_WKT: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AXIS["Latitude",NORTH],AXIS["Longitude",EAST],AUTHORITY["EPSG","4326"]]"#;

const BNG_WKT: &str = r#"PROJCS["OSGB36 / British National Grid",GEOGCS["OSGB36",DATUM["Ordnance_Survey_of_Great_Britain_1936",SPHEROID["Airy 1830",6377563.396,299.3249646,AUTHORITY["EPSG","7001"]],AUTHORITY["EPSG","6277"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4277"]],PROJECTION["Transverse_Mercator"],PARAMETER["latitude_of_origin",49],PARAMETER["central_meridian",-2],PARAMETER["scale_factor",0.9996012717],PARAMETER["false_easting",400000],PARAMETER["false_northing",-100000],UNIT["metre",1,AUTHORITY["EPSG","9001"]],AXIS["Easting",EAST],AXIS["Northing",NORTH],AUTHORITY["EPSG","27700"]]"#;

/// Reproject a station collection. Pure transform: attributes untouched,
/// row order and count preserved, only geometry and the collection CRS
/// change.
pub fn reproject_stations(set: &FeatureSet<Station>, target: Crs) -> FeatureSet<Station> {
    let features = set
        .features
        .iter()
        .map(|station| Station {
            point: station.point.map_coords(|c| transform_coord(c, set.crs, target)),
            ..station.clone()
        })
        .collect();
    FeatureSet::new(features, target)
}

/// Reproject a borough collection. Same guarantees as [`reproject_stations`].
pub fn reproject_boroughs(set: &FeatureSet<Borough>, target: Crs) -> FeatureSet<Borough> {
    let features = set
        .features
        .iter()
        .map(|borough| Borough {
            boundary: borough
                .boundary
                .map_coords(|c| transform_coord(c, set.crs, target)),
            ..borough.clone()
        })
        .collect();
    FeatureSet::new(features, target)
}

fn transform_coord(c: Coord<f64>, from: Crs, to: Crs) -> Coord<f64> {
    match (from, to) {
        (Crs::Wgs84, Crs::BritishNationalGrid) => {
            let (e, n) = wgs84_to_bng(c.x, c.y);
            Coord { x: e, y: n }
        }
        (Crs::BritishNationalGrid, Crs::Wgs84) => {
            let (lon, lat) = bng_to_wgs84(c.x, c.y);
            Coord { x: lon, y: lat }
        }
        _ => c,
    }
}

// ---------------------------------------------------------------------
// WGS84 <-> OSGB36 datum shift and the Ordnance Survey transverse
// Mercator projection. Formulae follow the OS "A guide to coordinate
// systems in Great Britain" (annexes B and C): geodetic -> cartesian,
// seven-parameter Helmert, cartesian -> geodetic, then the TM series.
// Accuracy of the Helmert shift is a few metres, which is the accepted
// bound for a single national set of parameters.
// ---------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Ellipsoid {
    a: f64,
    b: f64,
}

impl Ellipsoid {
    fn e2(&self) -> f64 {
        (self.a * self.a - self.b * self.b) / (self.a * self.a)
    }
}

const WGS84_ELLIPSOID: Ellipsoid = Ellipsoid {
    a: 6_378_137.0,
    b: 6_356_752.3142,
};

const AIRY_1830: Ellipsoid = Ellipsoid {
    a: 6_377_563.396,
    b: 6_356_256.909,
};

#[derive(Clone, Copy)]
struct Helmert {
    tx: f64,
    ty: f64,
    tz: f64,
    /// Rotations in arc-seconds.
    rx: f64,
    ry: f64,
    rz: f64,
    /// Scale change in parts per million.
    s: f64,
}

impl Helmert {
    fn inverse(&self) -> Helmert {
        Helmert {
            tx: -self.tx,
            ty: -self.ty,
            tz: -self.tz,
            rx: -self.rx,
            ry: -self.ry,
            rz: -self.rz,
            s: -self.s,
        }
    }
}

const WGS84_TO_OSGB36: Helmert = Helmert {
    tx: -446.448,
    ty: 125.157,
    tz: -542.060,
    rx: -0.1502,
    ry: -0.2470,
    rz: -0.8421,
    s: 20.4894,
};

// TM projection constants for the National Grid.
const F0: f64 = 0.999_601_271_7;
const LAT0_DEG: f64 = 49.0;
const LON0_DEG: f64 = -2.0;
const E0: f64 = 400_000.0;
const N0: f64 = -100_000.0;

const ARCSEC: f64 = std::f64::consts::PI / (180.0 * 3600.0);

fn geodetic_to_cartesian(ell: Ellipsoid, lat: f64, lon: f64) -> [f64; 3] {
    let e2 = ell.e2();
    let v = ell.a / (1.0 - e2 * lat.sin().powi(2)).sqrt();
    [
        v * lat.cos() * lon.cos(),
        v * lat.cos() * lon.sin(),
        (1.0 - e2) * v * lat.sin(),
    ]
}

fn cartesian_to_geodetic(ell: Ellipsoid, p: [f64; 3]) -> (f64, f64) {
    let e2 = ell.e2();
    let lon = p[1].atan2(p[0]);
    let rho = (p[0] * p[0] + p[1] * p[1]).sqrt();
    let mut lat = p[2].atan2(rho * (1.0 - e2));
    loop {
        let v = ell.a / (1.0 - e2 * lat.sin().powi(2)).sqrt();
        let next = (p[2] + e2 * v * lat.sin()).atan2(rho);
        if (next - lat).abs() < 1e-12 {
            lat = next;
            break;
        }
        lat = next;
    }
    (lat, lon)
}

fn helmert_shift(h: Helmert, p: [f64; 3]) -> [f64; 3] {
    let s = 1.0 + h.s * 1e-6;
    let rx = h.rx * ARCSEC;
    let ry = h.ry * ARCSEC;
    let rz = h.rz * ARCSEC;
    [
        h.tx + s * p[0] - rz * p[1] + ry * p[2],
        h.ty + rz * p[0] + s * p[1] - rx * p[2],
        h.tz - ry * p[0] + rx * p[1] + s * p[2],
    ]
}

/// Meridional arc, Airy 1830.
fn meridional_arc(lat: f64, lat0: f64) -> f64 {
    let n = (AIRY_1830.a - AIRY_1830.b) / (AIRY_1830.a + AIRY_1830.b);
    let n2 = n * n;
    let n3 = n2 * n;
    AIRY_1830.b
        * F0
        * ((1.0 + n + 1.25 * n2 + 1.25 * n3) * (lat - lat0)
            - (3.0 * n + 3.0 * n2 + 2.625 * n3) * (lat - lat0).sin() * (lat + lat0).cos()
            + (1.875 * n2 + 1.875 * n3) * (2.0 * (lat - lat0)).sin() * (2.0 * (lat + lat0)).cos()
            - (35.0 / 24.0) * n3 * (3.0 * (lat - lat0)).sin() * (3.0 * (lat + lat0)).cos())
}

/// OSGB36 geodetic coordinates (degrees) to National Grid easting/northing.
fn project_osgb36(lat_deg: f64, lon_deg: f64) -> (f64, f64) {
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();
    let lat0 = LAT0_DEG.to_radians();
    let lon0 = LON0_DEG.to_radians();

    let e2 = AIRY_1830.e2();
    let sin2 = lat.sin().powi(2);
    let v = AIRY_1830.a * F0 * (1.0 - e2 * sin2).powf(-0.5);
    let rho = AIRY_1830.a * F0 * (1.0 - e2) * (1.0 - e2 * sin2).powf(-1.5);
    let eta2 = v / rho - 1.0;

    let tan2 = lat.tan().powi(2);
    let tan4 = tan2 * tan2;
    let cos_lat = lat.cos();

    let i = meridional_arc(lat, lat0) + N0;
    let ii = v / 2.0 * lat.sin() * cos_lat;
    let iii = v / 24.0 * lat.sin() * cos_lat.powi(3) * (5.0 - tan2 + 9.0 * eta2);
    let iiia = v / 720.0 * lat.sin() * cos_lat.powi(5) * (61.0 - 58.0 * tan2 + tan4);
    let iv = v * cos_lat;
    let vv = v / 6.0 * cos_lat.powi(3) * (v / rho - tan2);
    let vi = v / 120.0
        * cos_lat.powi(5)
        * (5.0 - 18.0 * tan2 + tan4 + 14.0 * eta2 - 58.0 * tan2 * eta2);

    let dl = lon - lon0;
    let northing = i + ii * dl.powi(2) + iii * dl.powi(4) + iiia * dl.powi(6);
    let easting = E0 + iv * dl + vv * dl.powi(3) + vi * dl.powi(5);
    (easting, northing)
}

/// National Grid easting/northing to OSGB36 geodetic coordinates (degrees).
fn unproject_osgb36(easting: f64, northing: f64) -> (f64, f64) {
    let lat0 = LAT0_DEG.to_radians();
    let lon0 = LON0_DEG.to_radians();

    let mut lat = (northing - N0) / (AIRY_1830.a * F0) + lat0;
    loop {
        let m = meridional_arc(lat, lat0);
        if (northing - N0 - m).abs() < 1e-5 {
            break;
        }
        lat += (northing - N0 - m) / (AIRY_1830.a * F0);
    }

    let e2 = AIRY_1830.e2();
    let sin2 = lat.sin().powi(2);
    let v = AIRY_1830.a * F0 * (1.0 - e2 * sin2).powf(-0.5);
    let rho = AIRY_1830.a * F0 * (1.0 - e2) * (1.0 - e2 * sin2).powf(-1.5);
    let eta2 = v / rho - 1.0;

    let tan_lat = lat.tan();
    let tan2 = tan_lat * tan_lat;
    let tan4 = tan2 * tan2;
    let tan6 = tan4 * tan2;
    let sec_lat = 1.0 / lat.cos();

    let vii = tan_lat / (2.0 * rho * v);
    let viii = tan_lat / (24.0 * rho * v.powi(3)) * (5.0 + 3.0 * tan2 + eta2 - 9.0 * tan2 * eta2);
    let ix = tan_lat / (720.0 * rho * v.powi(5)) * (61.0 + 90.0 * tan2 + 45.0 * tan4);
    let x = sec_lat / v;
    let xi = sec_lat / (6.0 * v.powi(3)) * (v / rho + 2.0 * tan2);
    let xii = sec_lat / (120.0 * v.powi(5)) * (5.0 + 28.0 * tan2 + 24.0 * tan4);
    let xiia = sec_lat / (5040.0 * v.powi(7)) * (61.0 + 662.0 * tan2 + 1320.0 * tan4 + 720.0 * tan6);

    let de = easting - E0;
    let lat_out = lat - vii * de.powi(2) + viii * de.powi(4) - ix * de.powi(6);
    let lon_out = lon0 + x * de - xi * de.powi(3) + xii * de.powi(5) - xiia * de.powi(7);
    (lat_out.to_degrees(), lon_out.to_degrees())
}

/// WGS84 lon/lat (degrees) to British National Grid easting/northing.
pub fn wgs84_to_bng(lon: f64, lat: f64) -> (f64, f64) {
    let cart = geodetic_to_cartesian(WGS84_ELLIPSOID, lat.to_radians(), lon.to_radians());
    let shifted = helmert_shift(WGS84_TO_OSGB36, cart);
    let (lat36, lon36) = cartesian_to_geodetic(AIRY_1830, shifted);
    project_osgb36(lat36.to_degrees(), lon36.to_degrees())
}

/// British National Grid easting/northing to WGS84 lon/lat (degrees).
pub fn bng_to_wgs84(easting: f64, northing: f64) -> (f64, f64) {
    let (lat36, lon36) = unproject_osgb36(easting, northing);
    let cart = geodetic_to_cartesian(AIRY_1830, lat36.to_radians(), lon36.to_radians());
    let shifted = helmert_shift(WGS84_TO_OSGB36.inverse(), cart);
    let (lat, lon) = cartesian_to_geodetic(WGS84_ELLIPSOID, shifted);
    (lon.to_degrees(), lat.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, MultiPolygon, Polygon, LineString};

    // Worked example from the OS coordinate systems guide, annex C:
    // 52°39'27.2531"N 1°43'4.5177"E -> E 651409.903, N 313177.270.
    const OS_LAT: f64 = 52.0 + 39.0 / 60.0 + 27.2531 / 3600.0;
    const OS_LON: f64 = 1.0 + 43.0 / 60.0 + 4.5177 / 3600.0;

    #[test]
    fn os_worked_example_projects() {
        let (e, n) = project_osgb36(OS_LAT, OS_LON);
        assert!((e - 651_409.903).abs() < 0.01, "easting {e}");
        assert!((n - 313_177.270).abs() < 0.01, "northing {n}");
    }

    #[test]
    fn os_worked_example_unprojects() {
        let (lat, lon) = unproject_osgb36(651_409.903, 313_177.270);
        assert!((lat - OS_LAT).abs() < 5e-7, "lat {lat}");
        assert!((lon - OS_LON).abs() < 5e-7, "lon {lon}");
    }

    #[test]
    fn wgs84_roundtrip_within_tolerance() {
        for (lon, lat) in [(-0.1276, 51.5074), (0.30, 51.40), (-0.50, 51.65)] {
            let (e, n) = wgs84_to_bng(lon, lat);
            let (lon2, lat2) = bng_to_wgs84(e, n);
            assert!((lon - lon2).abs() < 1e-6, "{lon} -> {lon2}");
            assert!((lat - lat2).abs() < 1e-6, "{lat} -> {lat2}");
        }
    }

    #[test]
    fn grid_roundtrip_within_a_centimetre() {
        let (lon, lat) = bng_to_wgs84(530_000.0, 180_000.0);
        let (e, n) = wgs84_to_bng(lon, lat);
        assert!((e - 530_000.0).abs() < 0.01);
        assert!((n - 180_000.0).abs() < 0.01);
    }

    #[test]
    fn central_london_lands_on_the_expected_grid_square() {
        // Trafalgar Square is TQ 3001 8049, give or take the datum shift.
        let (e, n) = wgs84_to_bng(-0.1281, 51.5080);
        assert!((529_400.0..530_700.0).contains(&e), "easting {e}");
        assert!((179_800.0..181_100.0).contains(&n), "northing {n}");
    }

    #[test]
    fn unknown_epsg_code_is_rejected() {
        assert!(Crs::from_epsg(3857).is_err());
        assert_eq!(Crs::from_epsg(4326).unwrap(), Crs::Wgs84);
        assert_eq!(Crs::from_epsg(27700).unwrap(), Crs::BritishNationalGrid);
    }

    #[test]
    fn reprojection_preserves_attributes_and_order() {
        let stations = vec![
            Station {
                id: 7,
                name: "River Street, Clerkenwell".into(),
                area: "Clerkenwell".into(),
                bikes: 4,
                empty_slots: 10,
                total_slots: 14,
                point: point!(x: -0.109, y: 51.529),
                borough: None,
            },
            Station {
                id: 8,
                name: "Park Street, Bankside".into(),
                area: "Bankside".into(),
                bikes: 2,
                empty_slots: 16,
                total_slots: 18,
                point: point!(x: -0.092, y: 51.505),
                borough: Some("E09000028".into()),
            },
        ];
        let set = FeatureSet::new(stations, Crs::Wgs84);

        let projected = reproject_stations(&set, Crs::BritishNationalGrid);
        assert_eq!(projected.crs, Crs::BritishNationalGrid);
        assert_eq!(projected.len(), 2);
        assert_eq!(projected.features[0].id, 7);
        assert_eq!(projected.features[1].borough.as_deref(), Some("E09000028"));
        // metres now, not degrees
        assert!(projected.features[0].point.x() > 400_000.0);
    }

    #[test]
    fn identity_reprojection_keeps_coordinates() {
        let square = Polygon::new(
            LineString::from(vec![(0.0, 51.0), (0.1, 51.0), (0.1, 51.1), (0.0, 51.0)]),
            vec![],
        );
        let boroughs = vec![Borough {
            name: "Test".into(),
            gss_code: "E09000099".into(),
            hectares: 1.0,
            nonld_area: 0.0,
            ons_inner: false,
            sub_2006: None,
            sub_2009: None,
            boundary: MultiPolygon::new(vec![square]),
        }];
        let set = FeatureSet::new(boroughs, Crs::Wgs84);
        let same = reproject_boroughs(&set, Crs::Wgs84);
        assert_eq!(same.features[0].boundary, set.features[0].boundary);
    }
}
