//! JSON settings file, merged under command-line flags

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Every field is optional; a flag on the command line always wins
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileSettings {
    pub listen: Option<String>,
    pub upstreams: Option<String>,
    pub secret: Option<String>,
    pub server: Option<String>,
    pub server_name: Option<String>,
    pub bind_host: Option<String>,
    pub remap: Option<Vec<String>>,
    pub keep_alive_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub health_interval_secs: Option<u64>,
    pub health_policy: Option<String>,
    pub debug: Option<bool>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
}

impl FileSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid settings file {}", path.display()))
    }
}

/// Parse `remote=local` port pairs
pub fn parse_remaps(entries: &[String]) -> Result<HashMap<u16, u16>> {
    let mut map = HashMap::new();
    for entry in entries {
        let Some((remote, local)) = entry.split_once('=') else {
            bail!("Invalid remap {:?}, expected remote=local", entry);
        };
        let remote: u16 = remote
            .trim()
            .parse()
            .with_context(|| format!("Invalid remote port in {:?}", entry))?;
        let local: u16 = local
            .trim()
            .parse()
            .with_context(|| format!("Invalid local port in {:?}", entry))?;
        map.insert(remote, local);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remaps() {
        let map = parse_remaps(&["9000=19000".to_string(), " 22 = 2222 ".to_string()]).unwrap();
        assert_eq!(map.get(&9000), Some(&19000));
        assert_eq!(map.get(&22), Some(&2222));

        assert!(parse_remaps(&["9000".to_string()]).is_err());
        assert!(parse_remaps(&["x=1".to_string()]).is_err());
    }

    #[test]
    fn test_settings_json() {
        let settings: FileSettings = serde_json::from_str(
            r#"{"upstreams": "127.0.0.1:9000/tcp", "keep_alive_secs": 5, "remap": ["9000=0"]}"#,
        )
        .unwrap();
        assert_eq!(settings.upstreams.as_deref(), Some("127.0.0.1:9000/tcp"));
        assert_eq!(settings.keep_alive_secs, Some(5));
        assert!(settings.secret.is_none());

        assert!(serde_json::from_str::<FileSettings>(r#"{"unknown": 1}"#).is_err());
    }
}
