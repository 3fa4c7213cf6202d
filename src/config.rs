use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    pub processing: ProcessingConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    /// Station point dataset, GeoJSON or Shapefile.
    pub stations: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    /// EPSG code of the working CRS. Everything downstream of the
    /// reprojection step (joins, centroids, output layers) runs in it.
    pub target_epsg: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    pub geopackage: PathBuf,
    pub boroughs_layer: String,
    pub centroids_layer: String,
    pub stations_layer: String,
    /// Applies per layer, not to the container as a whole.
    pub overwrite: bool,
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }
}
