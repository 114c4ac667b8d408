use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub input: Option<InputConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Content-addressed file layout shared by all workers.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub documents_dir: PathBuf,
    pub previews_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

impl StorageConfig {
    pub fn document_path(&self, hash: &str) -> PathBuf {
        self.documents_dir.join(hash)
    }

    pub fn preview_path(&self, hash: &str) -> PathBuf {
        self.previews_dir.join(format!("{}.png", hash))
    }

    pub fn raster_path(&self, hash: &str) -> PathBuf {
        self.tmp_dir.join(format!("{}.png", hash))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.documents_dir, &self.previews_dir, &self.tmp_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_user")]
    pub default_user: i64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            queue_depth: default_queue_depth(),
            step_timeout_secs: default_step_timeout_secs(),
            default_user: default_user(),
        }
    }
}

impl ProcessingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `None` when step timeouts are disabled.
    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_timeout_secs > 0).then(|| Duration::from_secs(self.step_timeout_secs))
    }
}

fn default_workers() -> usize {
    2
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_queue_depth() -> usize {
    5
}
fn default_step_timeout_secs() -> u64 {
    300
}
fn default_user() -> i64 {
    1
}

/// Argv templates for the native tools. `{input}` and `{output}` are
/// substituted per call.
#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_thumbnail_cmd")]
    pub thumbnail: Vec<String>,
    #[serde(default = "default_rasterize_cmd")]
    pub rasterize: Vec<String>,
    #[serde(default = "default_ocr_cmd")]
    pub ocr: Vec<String>,
    #[serde(default = "default_raster_extensions")]
    pub raster_extensions: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            thumbnail: default_thumbnail_cmd(),
            rasterize: default_rasterize_cmd(),
            ocr: default_ocr_cmd(),
            raster_extensions: default_raster_extensions(),
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn default_thumbnail_cmd() -> Vec<String> {
    argv(&[
        "convert",
        "-thumbnail",
        "x500",
        "-background",
        "white",
        "-alpha",
        "remove",
        "{input}[0]",
        "{output}",
    ])
}
fn default_rasterize_cmd() -> Vec<String> {
    argv(&["convert", "-density", "300", "{input}", "-depth", "8", "{output}"])
}
fn default_ocr_cmd() -> Vec<String> {
    argv(&["tesseract", "{input}", "stdout"])
}
fn default_raster_extensions() -> Vec<String> {
    vec!["pdf".to_string()]
}

/// Inbox directory scanned by `shelf scan`.
#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    ["**/*.pdf", "**/*.png", "**/*.jpg", "**/*.jpeg", "**/*.tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.processing.workers == 0 {
        anyhow::bail!("processing.workers must be >= 1");
    }
    if config.processing.poll_interval_ms == 0 {
        anyhow::bail!("processing.poll_interval_ms must be >= 1");
    }
    if config.processing.queue_depth == 0 {
        anyhow::bail!("processing.queue_depth must be >= 1");
    }

    for (name, cmd) in [
        ("thumbnail", &config.extraction.thumbnail),
        ("rasterize", &config.extraction.rasterize),
        ("ocr", &config.extraction.ocr),
    ] {
        if cmd.is_empty() {
            anyhow::bail!("extraction.{} must name a command", name);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/var/lib/shelf/shelf.sqlite"

[storage]
documents_dir = "/var/lib/shelf/documents"
previews_dir = "/var/lib/shelf/previews"
tmp_dir = "/tmp/shelf"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.processing.workers, 2);
        assert_eq!(config.processing.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.extraction.raster_extensions, vec!["pdf"]);
        assert_eq!(config.logging.level, "info");
        assert!(config.input.is_none());
    }

    #[test]
    fn storage_layout_is_content_addressed() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(
            config.storage.document_path("abc"),
            PathBuf::from("/var/lib/shelf/documents/abc")
        );
        assert_eq!(
            config.storage.preview_path("abc"),
            PathBuf::from("/var/lib/shelf/previews/abc.png")
        );
        assert_eq!(
            config.storage.raster_path("abc"),
            PathBuf::from("/tmp/shelf/abc.png")
        );
    }

    #[test]
    fn zero_workers_rejected() {
        let text = format!("{}\n[processing]\nworkers = 0\n", MINIMAL);
        let config: Config = toml::from_str(&text).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn zero_timeout_disables_step_deadline() {
        let text = format!("{}\n[processing]\nstep_timeout_secs = 0\n", MINIMAL);
        let config: Config = toml::from_str(&text).unwrap();
        assert!(config.processing.step_timeout().is_none());
    }

    #[test]
    fn example_config_is_valid() {
        let config: Config = toml::from_str(include_str!("../config/shelf.example.toml")).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.extraction.ocr, vec!["tesseract", "{input}", "stdout"]);
        assert!(config.input.is_some());
    }
}
