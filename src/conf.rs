use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(crate = "rocket::serde", default)]
pub struct AppConfig {
    /// directory holding the blob files
    pub root_path: PathBuf,
    /// how long an issued access token stays valid
    pub token_valid_hours: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root_path: std::env::current_dir()
                .expect("Cannot access current dir???")
                .join("files"),
            token_valid_hours: 24,
        }
    }
}

impl AppConfig {
    pub fn from_rocket_config() -> Result<Self, figment::Error> {
        Figment::from(Toml::file("Rocket.toml").nested())
            .select("default")
            .extract()
    }
}
