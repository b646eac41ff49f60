use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlobStorageKind {
    Local,
    Memory,
}

fn default_blob_storage() -> BlobStorageKind {
    BlobStorageKind::Local
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub cache_address: String,
    pub store_endpoint: String,
    #[serde(default)]
    pub store_access_key: Option<String>,
    #[serde(default)]
    pub store_secret_key: Option<String>,
    #[serde(default = "default_namespace")]
    pub cache_namespace: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_blob_storage")]
    pub blob_storage: BlobStorageKind,
}

fn default_namespace() -> String {
    "data_api".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
