//! Folder configuration (findex.toml)

use std::path::{Path, PathBuf};

/// Index configuration: the replicated folders this process serves.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Folders shared with the cluster.
    #[serde(rename = "folder")]
    pub folders: Vec<FolderConfig>,
}

/// One replicated folder.
#[derive(Debug, serde::Deserialize)]
pub struct FolderConfig {
    /// Folder identifier; at most 64 bytes, used in persisted keys.
    pub id: String,
    /// Filesystem root of the folder.
    pub path: PathBuf,
}

/// Config file name.
pub const CONFIG_FILE: &str = "findex.toml";

impl Config {
    /// Load config from a directory.
    ///
    /// Returns default config if findex.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(dir: &Path) -> color_eyre::Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_with_folders() {
        let toml = r#"
[[folder]]
id = "photos"
path = "/home/user/photos"

[[folder]]
id = "docs"
path = "/home/user/documents"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.folders.len(), 2);
        assert_eq!(config.folders[0].id, "photos");
        assert_eq!(
            config.folders[1].path,
            PathBuf::from("/home/user/documents")
        );
    }

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.folders.is_empty());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(config.folders.is_empty());
    }
}
