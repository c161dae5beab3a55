/// Store configuration, loaded from YAML.
use serde::Deserialize;

use crate::error::Result;
use crate::tiles::Resampling;

pub const IN_MEMORY: &str = ":memory:";

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct StoreConfig {
    /// Path of the GeoPackage file, or `:memory:` for a transient store.
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_true")]
    pub create_if_missing: bool,
    #[serde(default = "default_tile_size")]
    pub tile_width: u32,
    #[serde(default = "default_tile_size")]
    pub tile_height: u32,
    #[serde(default = "default_tile_size")]
    pub feature_tile_size: u32,
    #[serde(default)]
    pub resampling: Resampling,
}

fn default_max_connections() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_tile_size() -> u32 {
    256
}

impl StoreConfig {
    /// Configuration for a transient in-memory store with default settings.
    pub fn in_memory() -> Self {
        StoreConfig {
            path: String::from(IN_MEMORY),
            max_connections: 1,
            create_if_missing: true,
            tile_width: default_tile_size(),
            tile_height: default_tile_size(),
            feature_tile_size: default_tile_size(),
            resampling: Resampling::default(),
        }
    }

    /// Constructs a configuration from a YAML string
    pub fn from_yaml(data: &str) -> Result<StoreConfig> {
        let mut config: StoreConfig = serde_yaml::from_str(data)?;

        // Every connection to an in-memory database sees its own database.
        if config.is_in_memory() {
            config.max_connections = 1;
        }

        Ok(config)
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.trim() == IN_MEMORY
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;

    use super::*;

    #[test]
    fn test_parse_store_config() {
        let mut file =
            File::open("test_data/store.yml").expect("Unable to open the test yml file.");
        let mut data = String::new();
        file.read_to_string(&mut data)
            .expect("Unable to read the file");

        match StoreConfig::from_yaml(data.as_str()) {
            Ok(config) => {
                assert_eq!("data/rivers.gpkg", config.path);
                assert_eq!(8, config.max_connections);
                assert_eq!(512, config.tile_width);
                assert_eq!(256, config.tile_height);
                assert_eq!(Resampling::Bilinear, config.resampling);
                assert!(!config.is_in_memory());
            }
            Err(e) => panic!("{}", e),
        }
    }

    #[test]
    fn test_in_memory_is_single_connection() {
        let config = StoreConfig::from_yaml("path: \":memory:\"\nmax_connections: 16\n")
            .expect("valid yaml");

        assert!(config.is_in_memory());
        assert_eq!(1, config.max_connections);
        assert!(config.create_if_missing);
        assert_eq!(Resampling::Nearest, config.resampling);
    }

    #[test]
    fn test_missing_path_is_an_error() {
        assert!(StoreConfig::from_yaml("tile_width: 256\n").is_err());
    }
}
