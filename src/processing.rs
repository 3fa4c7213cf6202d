use crate::types::{Borough, BoroughUsage, FeatureSet, JoinSummary, Station};
use anyhow::{anyhow, bail, Result};
use geo::algorithm::bounding_rect::BoundingRect;
use geo::{Centroid, Contains, InteriorPoint, Intersects, MultiPolygon, Point};
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashMap;
use std::hash::Hash;

// Wrapper for RTree indexing; geo polygons don't implement RTreeObject
// directly.
struct BoroughEnvelope {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for BoroughEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Assign each station the GSS code of the borough its point falls in.
///
/// Stations outside every borough keep `None`; that is valid missing
/// data, not an error. A point on a shared boundary intersects more than
/// one polygon, in which case the first borough in input order wins so
/// the result stays deterministic. Output cardinality always equals the
/// station count.
pub fn spatial_join(
    stations: &mut FeatureSet<Station>,
    boroughs: &FeatureSet<Borough>,
) -> Result<JoinSummary> {
    if stations.crs != boroughs.crs {
        bail!(
            "CRS mismatch: stations are in {}, boroughs in {}",
            stations.crs.name(),
            boroughs.crs.name()
        );
    }

    println!(
        "Spatially joining {} stations against {} boroughs...",
        stations.len(),
        boroughs.len()
    );

    let tree_items: Vec<BoroughEnvelope> = boroughs
        .features
        .iter()
        .enumerate()
        .filter_map(|(i, borough)| {
            borough.boundary.bounding_rect().map(|rect| BoroughEnvelope {
                index: i,
                aabb: AABB::from_corners(
                    [rect.min().x, rect.min().y],
                    [rect.max().x, rect.max().y],
                ),
            })
        })
        .collect();
    let tree = RTree::bulk_load(tree_items);

    let mut matched = 0;
    for station in &mut stations.features {
        let envelope = AABB::from_point([station.point.x(), station.point.y()]);

        let mut candidates: Vec<usize> = tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|c| c.index)
            .collect();
        // the tree returns candidates in arbitrary order; the tie-break is
        // first-by-input-order
        candidates.sort_unstable();

        station.borough = None;
        for idx in candidates {
            let borough = &boroughs.features[idx];
            if borough.boundary.intersects(&station.point) {
                station.borough = Some(borough.gss_code.clone());
                matched += 1;
                break;
            }
        }
    }

    let summary = JoinSummary {
        points: stations.len(),
        polygons: boroughs.len(),
        matched,
        unmatched: stations.len() - matched,
    };
    println!(
        "Spatial join: {} of {} stations matched across {} boroughs ({} unmatched)",
        summary.matched, summary.points, summary.polygons, summary.unmatched
    );
    Ok(summary)
}

/// Group stations by containing borough: station count plus total slot
/// capacity per borough.
///
/// Stations without a borough are excluded up front, before grouping.
/// With `sort_by_count` the result is ordered by descending station
/// count (GSS code breaks ties); otherwise by GSS code.
pub fn aggregate_by_borough(
    stations: &FeatureSet<Station>,
    sort_by_count: bool,
) -> Vec<BoroughUsage> {
    let mut groups: HashMap<&str, (usize, u64)> = HashMap::new();
    for station in &stations.features {
        let code = match &station.borough {
            Some(code) => code.as_str(),
            None => continue,
        };
        let entry = groups.entry(code).or_default();
        entry.0 += 1;
        entry.1 += u64::from(station.total_slots);
    }

    let mut usage: Vec<BoroughUsage> = groups
        .into_iter()
        .map(|(gss_code, (stations, total_slots))| BoroughUsage {
            gss_code: gss_code.to_string(),
            stations,
            total_slots,
        })
        .collect();

    if sort_by_count {
        usage.sort_by(|a, b| {
            b.stations
                .cmp(&a.stations)
                .then_with(|| a.gss_code.cmp(&b.gss_code))
        });
    } else {
        usage.sort_by(|a, b| a.gss_code.cmp(&b.gss_code));
    }
    usage
}

/// Strict inner join on a key extracted from each side.
///
/// Returns `(left_index, right_index)` pairs in left-then-right input
/// order. Rows without a partner are excluded on both sides, so the
/// output never exceeds `left.len() * right.len()` and, for unique keys,
/// never exceeds the smaller input.
pub fn attribute_join<L, R, K, FL, FR>(
    left: &[L],
    right: &[R],
    left_key: FL,
    right_key: FR,
) -> Vec<(usize, usize)>
where
    K: Eq + Hash,
    FL: Fn(&L) -> K,
    FR: Fn(&R) -> K,
{
    let mut right_by_key: HashMap<K, Vec<usize>> = HashMap::new();
    for (j, row) in right.iter().enumerate() {
        right_by_key.entry(right_key(row)).or_default().push(j);
    }

    let mut pairs = Vec::new();
    for (i, row) in left.iter().enumerate() {
        if let Some(matches) = right_by_key.get(&left_key(row)) {
            for &j in matches {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

/// Geometric center of mass. May fall outside a non-convex boundary, so
/// don't use it where the marker must sit on the borough itself.
pub fn centroid(boundary: &MultiPolygon<f64>) -> Result<Point<f64>> {
    boundary
        .centroid()
        .ok_or_else(|| anyhow!("Cannot compute the centroid of an empty geometry"))
}

/// A point guaranteed to lie inside the boundary, at the cost of being
/// arbitrary rather than central.
pub fn representative_point(boundary: &MultiPolygon<f64>) -> Result<Point<f64>> {
    boundary
        .interior_point()
        .ok_or_else(|| anyhow!("Cannot compute an interior point of an empty geometry"))
}

/// Symbol placement point: the centroid when it lands on the borough,
/// otherwise the representative point.
pub fn marker_point(boundary: &MultiPolygon<f64>) -> Result<Point<f64>> {
    let center = centroid(boundary)?;
    if boundary.contains(&center) {
        Ok(center)
    } else {
        representative_point(boundary)
    }
}
