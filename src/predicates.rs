use geo::{EuclideanDistance, Geometry, Point, Relate};

/// Binary DE-9IM predicates between two geometries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialPredicate {
    Contains,
    Within,
    Intersects,
    Touches,
    Crosses,
    Overlaps,
    Equals,
    Covers,
    CoveredBy,
    Disjoint,
}

/// Evaluate `a <predicate> b`. Read-only; the operands are untouched.
pub fn evaluate(predicate: SpatialPredicate, a: &Geometry<f64>, b: &Geometry<f64>) -> bool {
    let matrix = a.relate(b);
    match predicate {
        SpatialPredicate::Contains => matrix.is_contains(),
        SpatialPredicate::Within => matrix.is_within(),
        SpatialPredicate::Intersects => matrix.is_intersects(),
        SpatialPredicate::Touches => matrix.is_touches(),
        SpatialPredicate::Crosses => matrix.is_crosses(),
        SpatialPredicate::Overlaps => matrix.is_overlaps(),
        SpatialPredicate::Equals => matrix.is_equal_topo(),
        SpatialPredicate::Covers => matrix.is_covers(),
        SpatialPredicate::CoveredBy => matrix.is_coveredby(),
        SpatialPredicate::Disjoint => matrix.is_disjoint(),
    }
}

/// Indices of the collection members for which `member <predicate> probe`
/// holds. Ad-hoc lookup helper ("which borough contains this station"),
/// not a bulk join.
pub fn matching_indices(
    predicate: SpatialPredicate,
    geometries: &[Geometry<f64>],
    probe: &Geometry<f64>,
) -> Vec<usize> {
    geometries
        .iter()
        .enumerate()
        .filter(|(_, g)| evaluate(predicate, g, probe))
        .map(|(i, _)| i)
        .collect()
}

/// Distance-bounded predicate for point probes, in the units of the
/// collection CRS (metres once projected).
pub fn within_distance(point: &Point<f64>, geometry: &Geometry<f64>, max_distance: f64) -> bool {
    distance_to(point, geometry) <= max_distance
}

fn distance_to(point: &Point<f64>, geometry: &Geometry<f64>) -> f64 {
    match geometry {
        Geometry::Point(g) => point.euclidean_distance(g),
        Geometry::Line(g) => point.euclidean_distance(g),
        Geometry::LineString(g) => point.euclidean_distance(g),
        Geometry::Polygon(g) => point.euclidean_distance(g),
        Geometry::MultiLineString(g) => point.euclidean_distance(g),
        Geometry::MultiPolygon(g) => point.euclidean_distance(g),
        Geometry::MultiPoint(g) => g
            .iter()
            .map(|p| point.euclidean_distance(p))
            .fold(f64::INFINITY, f64::min),
        Geometry::GeometryCollection(g) => g
            .iter()
            .map(|child| distance_to(point, child))
            .fold(f64::INFINITY, f64::min),
        Geometry::Rect(g) => point.euclidean_distance(&g.to_polygon()),
        Geometry::Triangle(g) => point.euclidean_distance(&g.to_polygon()),
    }
}
