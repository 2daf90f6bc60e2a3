//! Reading configuration files from disk.

use crate::pathway::{PathwayCatalog, PathwayFilter};
use crate::pools::{DataPools, Doctor, Location, OrderProfile};
use crate::templates::HardcodedCatalog;
use crate::{ConfigError, ConfigResult};
use hl7::HeaderConfig;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Parses YAML text, reporting the failing key path on a schema mismatch.
///
/// `file` is only used in the error message.
pub fn parse_yaml<T: DeserializeOwned>(text: &str, file: &Path) -> ConfigResult<T> {
    let deserializer = serde_yaml::Deserializer::from_str(text);
    serde_path_to_error::deserialize(deserializer).map_err(|err| {
        let field = err.path().to_string();
        let field = if field.is_empty() || field == "." {
            "<root>".to_string()
        } else {
            field
        };
        ConfigError::Schema {
            file: file.to_path_buf(),
            field,
            message: err.into_inner().to_string(),
        }
    })
}

/// Reads and parses one YAML file.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> ConfigResult<T> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_yaml(&text, path)
}

/// Locations of every configuration input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigPaths {
    pub data: PathBuf,
    pub locations: PathBuf,
    pub doctors: PathBuf,
    pub order_profiles: PathBuf,
    pub header: PathBuf,
    pub pathways_dir: PathBuf,
    pub hardcoded_dir: PathBuf,
}

impl ConfigPaths {
    /// The default layout below `root`.
    pub fn under(root: &Path) -> Self {
        let configs = root.join("configs");
        Self {
            data: configs.join("data.yml"),
            locations: configs.join("locations.yml"),
            doctors: configs.join("doctors.yml"),
            order_profiles: configs.join("order_profiles.yml"),
            header: configs.join("header.yml"),
            pathways_dir: configs.join("pathways"),
            hardcoded_dir: configs.join("hardcoded_messages"),
        }
    }
}

/// Everything loaded from configuration files.
#[derive(Clone, Debug)]
pub struct LoadedConfig {
    pub pools: DataPools,
    pub header: HeaderConfig,
    pub catalog: PathwayCatalog,
    pub templates: HardcodedCatalog,
}

impl LoadedConfig {
    /// Names of pathways admitted by `filter`.
    pub fn eligible_names(&self, filter: &PathwayFilter) -> Vec<String> {
        self.catalog
            .filtered(filter)
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }
}

/// Loads and cross-checks every configuration file.
///
/// # Errors
///
/// Returns the first read, parse or validation error. References from pathways to locations,
/// order profiles and hardcoded messages are checked here, so a successful load cannot later
/// fail on a missing definition.
pub fn load_all(paths: &ConfigPaths) -> ConfigResult<LoadedConfig> {
    let locations: BTreeMap<String, Location> = read_yaml(&paths.locations)?;
    let doctors: Vec<Doctor> = read_yaml(&paths.doctors)?;
    let order_profiles: BTreeMap<String, OrderProfile> = read_yaml(&paths.order_profiles)?;
    let pools = DataPools::from_files(read_yaml(&paths.data)?, locations, doctors, order_profiles)?;

    let header_text = std::fs::read_to_string(&paths.header).map_err(|source| ConfigError::Read {
        path: paths.header.clone(),
        source,
    })?;
    let header = HeaderConfig::parse(&header_text)?;

    let templates = HardcodedCatalog::load_dir(&paths.hardcoded_dir)?;
    let catalog = PathwayCatalog::load_dir(&paths.pathways_dir)?;
    catalog.check_references(&pools, &templates)?;

    tracing::info!(
        pathways = catalog.len(),
        templates = templates.len(),
        locations = pools.locations.len(),
        doctors = pools.doctors.len(),
        "configuration loaded"
    );

    Ok(LoadedConfig {
        pools,
        header,
        catalog,
        templates,
    })
}
