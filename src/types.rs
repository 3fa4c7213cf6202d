use geo::{MultiPolygon, Point};

use crate::crs::Crs;

/// A cycle hire docking station.
#[derive(Debug, Clone)]
pub struct Station {
    pub id: i64,
    pub name: String,
    /// Locality label, e.g. "Soho". Not a borough name.
    pub area: String,
    pub bikes: u32,
    pub empty_slots: u32,
    /// Derived: bikes + empty_slots. Recomputed, never loaded.
    pub total_slots: u32,
    pub point: Point<f64>,
    /// GSS code of the containing borough. None until the spatial join
    /// runs, and None afterwards exactly when no borough intersects the
    /// station point.
    pub borough: Option<String>,
}

/// A London borough boundary with its standard attribute set.
#[derive(Debug, Clone)]
pub struct Borough {
    pub name: String,
    /// ONS GSS code, unique per borough.
    pub gss_code: String,
    pub hectares: f64,
    pub nonld_area: f64,
    pub ons_inner: bool,
    // Legacy columns carried through from the source table; always empty.
    pub sub_2006: Option<String>,
    pub sub_2009: Option<String>,
    pub boundary: MultiPolygon<f64>,
}

/// An ordered set of features sharing one attribute schema and one CRS.
///
/// The CRS belongs to the whole collection, not to individual features;
/// operations combining two collections must check it matches on both
/// sides first.
#[derive(Debug, Clone)]
pub struct FeatureSet<T> {
    pub features: Vec<T>,
    pub crs: Crs,
}

impl<T> FeatureSet<T> {
    pub fn new(features: Vec<T>, crs: Crs) -> Self {
        Self { features, crs }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Outcome of mapping stations onto borough polygons.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSummary {
    pub points: usize,
    pub polygons: usize,
    pub matched: usize,
    pub unmatched: usize,
}

/// One aggregation row: stations grouped by containing borough.
#[derive(Debug, Clone, PartialEq)]
pub struct BoroughUsage {
    pub gss_code: String,
    pub stations: usize,
    pub total_slots: u64,
}
