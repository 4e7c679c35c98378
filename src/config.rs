use anyhow::{anyhow, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

pub const QUEUE_FILE: &str = "download_queue.json";
pub const HISTORY_FILE: &str = "download_history.json";
pub const MAILBOX_FILE: &str = "remote_queue.json";

/// The structure of our configuration file (config.toml)
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub download_directory: String,
    pub data_directory: String,
    pub default_quality: String,
    pub default_format: String,
    pub audio_bitrate: String,
    pub auto_download: bool,
    pub agent_binary: String,
    pub api_host: String,
    pub api_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        // Use the 'directories' crate to find the user's download directory.
        let download_directory = UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|p| p.to_string_lossy().to_string()))
            .unwrap_or_else(|| "downloads".to_string());
        let data_directory = project_dirs()
            .map(|dirs| dirs.data_local_dir().to_string_lossy().to_string())
            .unwrap_or_else(|_| ".".to_string());

        Config {
            download_directory,
            data_directory,
            default_quality: "best".to_string(),
            default_format: "mp4".to_string(),
            audio_bitrate: "192k".to_string(),
            auto_download: false,
            agent_binary: "yt-dlp".to_string(),
            api_host: "127.0.0.1".to_string(),
            api_port: 5000,
        }
    }
}

impl Config {
    pub fn queue_path(&self) -> PathBuf {
        PathBuf::from(&self.data_directory).join(QUEUE_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        PathBuf::from(&self.data_directory).join(HISTORY_FILE)
    }

    pub fn mailbox_path(&self) -> PathBuf {
        PathBuf::from(&self.data_directory).join(MAILBOX_FILE)
    }

    /// Bind address for the API listener; `HOST`/`PORT` take precedence.
    pub fn api_addr(&self) -> String {
        let host = std::env::var("HOST").unwrap_or_else(|_| self.api_host.clone());
        let port = std::env::var("PORT").unwrap_or_else(|_| self.api_port.to_string());
        format!("{}:{}", host, port)
    }
}

pub fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "ytq", "ytq")
        .ok_or_else(|| anyhow!("Could not find a valid home directory to store config"))
}

/// Returns the cross-platform path to the configuration file, creating the directory if needed.
async fn get_config_path() -> Result<PathBuf> {
    let project_dirs = project_dirs()?;
    let config_dir = project_dirs.config_dir();
    fs::create_dir_all(config_dir).await?;
    Ok(config_dir.join("config.toml"))
}

/// Loads the configuration from the file, or creates a default one if it doesn't exist.
pub async fn load_config() -> Result<Config> {
    let config_path = get_config_path().await?;

    if !config_path.exists() {
        tracing::info!(
            "No config file found. Creating a default one at: {}",
            config_path.display()
        );
        let default_config = Config::default();
        save_config(&default_config).await?;
        return Ok(default_config);
    }

    let config_content = fs::read_to_string(&config_path).await?;
    let config = parse_config(&config_content)
        .map_err(|e| anyhow!("Failed to parse config file at {}: {}", config_path.display(), e))?;

    fs::create_dir_all(&config.data_directory).await?;
    Ok(config)
}

fn parse_config(content: &str) -> std::result::Result<Config, toml::de::Error> {
    toml::from_str(content)
}

/// Saves the provided configuration object to the file.
pub async fn save_config(config: &Config) -> Result<()> {
    let config_path = get_config_path().await?;
    let toml_string = toml::to_string_pretty(config)?;
    fs::write(config_path, toml_string).await?;
    fs::create_dir_all(&config.data_directory).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config = parse_config("auto_download = true\naudio_bitrate = \"320k\"\n").unwrap();
        assert!(config.auto_download);
        assert_eq!(config.audio_bitrate, "320k");
        assert_eq!(config.default_quality, "best");
        assert_eq!(config.default_format, "mp4");
        assert_eq!(config.agent_binary, "yt-dlp");
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(parse_config("api_port = \"not a number\"").is_err());
    }

    #[test]
    fn data_files_live_under_data_directory() {
        let config = Config { data_directory: "/tmp/ytq".to_string(), ..Config::default() };
        assert_eq!(config.queue_path(), PathBuf::from("/tmp/ytq").join(QUEUE_FILE));
        assert_eq!(config.history_path(), PathBuf::from("/tmp/ytq").join(HISTORY_FILE));
        assert_eq!(config.mailbox_path(), PathBuf::from("/tmp/ytq").join(MAILBOX_FILE));
    }
}
