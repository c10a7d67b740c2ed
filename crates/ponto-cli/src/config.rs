use anyhow::{Context, Result};
use ponto_core::settings::parse_setting;
use ponto_core::EngineSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: optional TOML file, then `PONTO_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the enrollment tree (`<dataset_dir>/<identity>/*.jpg`).
    pub dataset_dir: PathBuf,
    /// OpenCV Haar cascade XML.
    pub cascade_path: PathBuf,
    pub engine: EngineSettings,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            dataset_dir: data_dir.join("dataset"),
            cascade_path: data_dir.join("haarcascade_frontalface_default.xml"),
            engine: EngineSettings::default(),
        }
    }
}

impl Config {
    /// Load `path` (if given), apply the process environment and clamp the
    /// engine settings.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.engine = config.engine.sanitized();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply `PONTO_*` overrides. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("PONTO_DATASET_DIR") {
            self.dataset_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("PONTO_CASCADE_PATH") {
            self.cascade_path = PathBuf::from(path);
        }

        let engine = &mut self.engine;
        env_f64(&lookup, "PONTO_THRESHOLD", &mut engine.threshold);
        env_f64(&lookup, "PONTO_STABLE_SECONDS", &mut engine.stable_seconds);
        env_f64(&lookup, "PONTO_COOLDOWN_SECONDS", &mut engine.cooldown_seconds);
        env_f64(&lookup, "PONTO_PENDING_TTL_SECONDS", &mut engine.pending_ttl_seconds);

        if let Some(raw) = lookup("PONTO_MIN_FACE_SIZE") {
            match raw.trim().parse::<u32>() {
                Ok(v) => engine.min_face_size = v,
                Err(_) => tracing::warn!(key = "PONTO_MIN_FACE_SIZE", value = %raw, "ignoring invalid value"),
            }
        }
    }
}

fn env_f64(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, slot: &mut f64) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match parse_setting(key, &raw) {
        Ok(v) => *slot = v,
        Err(e) => tracing::warn!(key, error = %e, "ignoring invalid value"),
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("ponto")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("PONTO_DATASET_DIR", "/srv/faces"),
            ("PONTO_THRESHOLD", "70"),
            ("PONTO_STABLE_SECONDS", "3.5"),
            ("PONTO_MIN_FACE_SIZE", "48"),
        ]));
        assert_eq!(config.dataset_dir, PathBuf::from("/srv/faces"));
        assert_eq!(config.engine.threshold, 70.0);
        assert_eq!(config.engine.stable_seconds, 3.5);
        assert_eq!(config.engine.min_face_size, 48);
    }

    #[test]
    fn test_invalid_env_keeps_previous() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("PONTO_THRESHOLD", "high"),
            ("PONTO_COOLDOWN_SECONDS", "NaN"),
            ("PONTO_MIN_FACE_SIZE", "-1"),
        ]));
        assert_eq!(config.engine, EngineSettings::default());
    }

    #[test]
    fn test_toml_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ponto.toml");
        std::fs::write(
            &path,
            "dataset_dir = \"/data/faces\"\n\n[engine]\nthreshold = 95.0\ncooldown_seconds = 10.0\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.dataset_dir, PathBuf::from("/data/faces"));
        assert_eq!(config.engine.threshold, 95.0);
        assert_eq!(config.engine.cooldown_seconds, 10.0);
        assert_eq!(config.engine.stable_seconds, 5.0);
        assert_eq!(config.cascade_path, Config::default().cascade_path);
    }

    #[test]
    fn test_bad_toml_reports_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("broken.toml");
        std::fs::write(&path, "engine = 3").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.toml"));
    }
}
