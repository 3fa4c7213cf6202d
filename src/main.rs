pub mod types;
pub mod config;
pub mod crs;
pub mod data;
pub mod processing;
pub mod predicates;
pub mod gpkg;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::AppConfig;
use crate::crs::Crs;
use crate::gpkg::{ColumnKind, ColumnSpec, FeatureRow, FieldValue, GeoPackage, GeometryKind, LayerDef};
use crate::types::{Borough, BoroughUsage, FeatureSet, Station};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline and write the GeoPackage layers
    Run {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Inspect the output container without loading feature data
    Layers {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { config } => {
            println!("Running pipeline with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;
            run_pipeline(&app_config)?;
            println!("Pipeline complete!");
        }
        Commands::Layers { config } => {
            let app_config = AppConfig::load_from_file(config)?;
            let gpkg = GeoPackage::open_read_only(&app_config.output.geopackage)?;
            println!("Layers in {:?}:", app_config.output.geopackage);
            for layer in gpkg.list_layers()? {
                println!("  {} ({} features)", layer, gpkg.feature_count(&layer)?);
            }
        }
    }

    Ok(())
}

fn run_pipeline(config: &AppConfig) -> Result<()> {
    let target = Crs::from_epsg(config.processing.target_epsg)?;

    // 1. Load Data
    let mut stations = data::load_stations(&config.input.stations)?;
    if stations.is_empty() {
        bail!("Station dataset {:?} is empty", config.input.stations);
    }
    let boroughs = data::load_boroughs()?;

    // 2. Derive the capacity column
    data::recompute_total_slots(&mut stations);

    // 3. Reproject both collections into the working CRS
    println!("Reprojecting to {} (EPSG:{})...", target.name(), target.epsg());
    let mut stations = crs::reproject_stations(&stations, target);
    let boroughs = crs::reproject_boroughs(&boroughs, target);

    // 4. Spatial join: station -> containing borough
    processing::spatial_join(&mut stations, &boroughs)?;

    // 5. Aggregate per borough, busiest first
    let usage = processing::aggregate_by_borough(&stations, true);
    println!("Aggregated usage for {} boroughs", usage.len());
    if let Some(top) = usage.first() {
        println!(
            "Busiest borough: {} ({} stations, {} slots)",
            top.gss_code, top.stations, top.total_slots
        );
    }

    // 6. Attribute join: attach the stats back onto the borough table
    let borough_pairs = processing::attribute_join(
        &boroughs.features,
        &usage,
        |b| b.gss_code.clone(),
        |u| u.gss_code.clone(),
    );
    println!(
        "Attribute join matched {} of {} boroughs",
        borough_pairs.len(),
        boroughs.len()
    );

    // 7. Ad-hoc lookup: which borough covers the largest dock?
    if let Some(largest) = stations.features.iter().max_by_key(|s| s.total_slots) {
        let boundaries: Vec<geo::Geometry<f64>> = boroughs
            .features
            .iter()
            .map(|b| geo::Geometry::MultiPolygon(b.boundary.clone()))
            .collect();
        let probe = geo::Geometry::Point(largest.point);
        let hits = predicates::matching_indices(
            predicates::SpatialPredicate::Covers,
            &boundaries,
            &probe,
        );
        match hits.first() {
            Some(&idx) => println!(
                "Largest dock '{}' ({} slots) sits in {}",
                largest.name, largest.total_slots, boroughs.features[idx].name
            ),
            None => println!(
                "Largest dock '{}' sits outside every borough",
                largest.name
            ),
        }

        let nearby = stations
            .features
            .iter()
            .filter(|s| predicates::within_distance(&s.point, &probe, 2_000.0))
            .count();
        println!("{} stations within 2 km of it", nearby);
    }

    // 8. Write the three output layers
    write_output(config, &boroughs, &stations, &usage, &borough_pairs)?;

    // 9. Verify the container by listing it back
    verify_output(config)?;

    Ok(())
}

fn write_output(
    config: &AppConfig,
    boroughs: &FeatureSet<Borough>,
    stations: &FeatureSet<Station>,
    usage: &[BoroughUsage],
    borough_pairs: &[(usize, usize)],
) -> Result<()> {
    let path = &config.output.geopackage;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    println!("Writing output container {:?}...", path);
    let mut container = GeoPackage::create_or_open(path)?;
    let overwrite = config.output.overwrite;
    let crs = boroughs.crs;

    // boroughs + stats
    let borough_def = LayerDef {
        name: config.output.boroughs_layer.clone(),
        geometry: GeometryKind::MultiPolygon,
        crs,
        columns: vec![
            ColumnSpec::new("name", ColumnKind::Text),
            ColumnSpec::new("gss_code", ColumnKind::Text),
            ColumnSpec::new("hectares", ColumnKind::Real),
            ColumnSpec::new("nonld_area", ColumnKind::Real),
            ColumnSpec::new("ons_inner", ColumnKind::Text),
            ColumnSpec::new("sub_2006", ColumnKind::Text),
            ColumnSpec::new("sub_2009", ColumnKind::Text),
            ColumnSpec::new("stations", ColumnKind::Integer),
            ColumnSpec::new("total_slots", ColumnKind::Integer),
        ],
    };
    let mut borough_rows = Vec::with_capacity(borough_pairs.len());
    for &(b_idx, u_idx) in borough_pairs {
        let borough = &boroughs.features[b_idx];
        let stats = &usage[u_idx];
        borough_rows.push(FeatureRow {
            geometry: Some(geo::Geometry::MultiPolygon(borough.boundary.clone())),
            values: borough_values(borough, stats),
        });
    }
    let written = container.write_layer(&borough_def, &borough_rows, overwrite)?;
    println!("  {}: {} features", borough_def.name, written);

    // borough markers + stats
    let centroid_def = LayerDef {
        name: config.output.centroids_layer.clone(),
        geometry: GeometryKind::Point,
        crs,
        columns: vec![
            ColumnSpec::new("name", ColumnKind::Text),
            ColumnSpec::new("gss_code", ColumnKind::Text),
            ColumnSpec::new("stations", ColumnKind::Integer),
            ColumnSpec::new("total_slots", ColumnKind::Integer),
        ],
    };
    let mut centroid_rows = Vec::with_capacity(borough_pairs.len());
    for &(b_idx, u_idx) in borough_pairs {
        let borough = &boroughs.features[b_idx];
        let stats = &usage[u_idx];
        let marker = processing::marker_point(&borough.boundary)?;
        centroid_rows.push(FeatureRow {
            geometry: Some(geo::Geometry::Point(marker)),
            values: vec![
                FieldValue::from(borough.name.clone()),
                FieldValue::from(borough.gss_code.clone()),
                FieldValue::from(stats.stations as i64),
                FieldValue::from(stats.total_slots as i64),
            ],
        });
    }
    let written = container.write_layer(&centroid_def, &centroid_rows, overwrite)?;
    println!("  {}: {} features", centroid_def.name, written);

    // stations + stats; cardinality matches the input, unmatched stations
    // carry nulls
    let station_def = LayerDef {
        name: config.output.stations_layer.clone(),
        geometry: GeometryKind::Point,
        crs,
        columns: vec![
            ColumnSpec::new("id", ColumnKind::Integer),
            ColumnSpec::new("name", ColumnKind::Text),
            ColumnSpec::new("area", ColumnKind::Text),
            ColumnSpec::new("bikes", ColumnKind::Integer),
            ColumnSpec::new("empty_slots", ColumnKind::Integer),
            ColumnSpec::new("total_slots", ColumnKind::Integer),
            ColumnSpec::new("borough", ColumnKind::Text),
            ColumnSpec::new("borough_stations", ColumnKind::Integer),
            ColumnSpec::new("borough_total_slots", ColumnKind::Integer),
        ],
    };
    let station_pairs = processing::attribute_join(
        &stations.features,
        usage,
        |s| s.borough.clone(),
        |u| Some(u.gss_code.clone()),
    );
    let stats_by_station: HashMap<usize, usize> = station_pairs.into_iter().collect();

    let mut station_rows = Vec::with_capacity(stations.len());
    for (idx, station) in stations.features.iter().enumerate() {
        let stats = stats_by_station.get(&idx).map(|&u_idx| &usage[u_idx]);
        station_rows.push(FeatureRow {
            geometry: Some(geo::Geometry::Point(station.point)),
            values: station_values(station, stats),
        });
    }
    let written = container.write_layer(&station_def, &station_rows, overwrite)?;
    println!("  {}: {} features", station_def.name, written);

    Ok(())
}

fn borough_values(borough: &Borough, stats: &BoroughUsage) -> Vec<FieldValue> {
    vec![
        FieldValue::from(borough.name.clone()),
        FieldValue::from(borough.gss_code.clone()),
        FieldValue::from(borough.hectares),
        FieldValue::from(borough.nonld_area),
        FieldValue::from(if borough.ons_inner { "T" } else { "F" }),
        FieldValue::from(borough.sub_2006.clone()),
        FieldValue::from(borough.sub_2009.clone()),
        FieldValue::from(stats.stations as i64),
        FieldValue::from(stats.total_slots as i64),
    ]
}

fn station_values(station: &Station, stats: Option<&BoroughUsage>) -> Vec<FieldValue> {
    vec![
        FieldValue::from(station.id),
        FieldValue::from(station.name.clone()),
        FieldValue::from(station.area.clone()),
        FieldValue::from(station.bikes),
        FieldValue::from(station.empty_slots),
        FieldValue::from(station.total_slots),
        FieldValue::from(station.borough.clone()),
        match stats {
            Some(u) => FieldValue::from(u.stations as i64),
            None => FieldValue::Null,
        },
        match stats {
            Some(u) => FieldValue::from(u.total_slots as i64),
            None => FieldValue::Null,
        },
    ]
}

fn verify_output(config: &AppConfig) -> Result<()> {
    let gpkg = GeoPackage::open_read_only(&config.output.geopackage)?;
    let layers = gpkg.list_layers()?;
    println!("Container now holds {} layers: {:?}", layers.len(), layers);

    for name in [
        &config.output.boroughs_layer,
        &config.output.centroids_layer,
        &config.output.stations_layer,
    ] {
        if !layers.iter().any(|l| l == name) {
            bail!("Expected layer '{}' missing after write", name);
        }
    }
    Ok(())
}
