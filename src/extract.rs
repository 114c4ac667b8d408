//! Text and image extraction capability.
//!
//! The pipeline never talks to native tools directly. It goes through the
//! [`Extractor`] trait, which has three operations: render a preview
//! thumbnail, rasterize a page-oriented document into an image, and read
//! text out of an image. [`CommandExtractor`] binds them to external
//! programs (ImageMagick and tesseract by default) through argv templates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::ExtractionConfig;

/// Failure of a single extraction call. Never fatal to a worker.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("command template is empty")]
    EmptyCommand,

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("'{program}' did not produce {}", path.display())]
    MissingOutput { program: String, path: PathBuf },

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("extraction panicked: {0}")]
    Panicked(String),
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Render a preview image of the first page of `source` into `output`.
    async fn thumbnail(&self, source: &Path, output: &Path) -> Result<(), ExtractError>;

    /// Rasterize a page-oriented document into `output`, returning the
    /// image path to feed into [`extract_text`](Extractor::extract_text).
    async fn rasterize(&self, source: &Path, output: &Path) -> Result<PathBuf, ExtractError>;

    /// Read the text content of an image.
    async fn extract_text(&self, image: &Path) -> Result<String, ExtractError>;
}

/// Run an extraction future with an optional deadline.
pub async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> Result<T, ExtractError>
where
    F: std::future::Future<Output = Result<T, ExtractError>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(ExtractError::Timeout {
                secs: limit.as_secs(),
            }),
        },
        None => fut.await,
    }
}

/// Whether `filename` must be rasterized before OCR.
pub fn is_page_oriented(filename: &Path, raster_extensions: &[String]) -> bool {
    filename
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| raster_extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
}

/// [`Extractor`] backed by external programs.
pub struct CommandExtractor {
    thumbnail: Vec<String>,
    rasterize: Vec<String>,
    ocr: Vec<String>,
}

impl CommandExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            thumbnail: config.thumbnail.clone(),
            rasterize: config.rasterize.clone(),
            ocr: config.ocr.clone(),
        }
    }

    async fn run(
        &self,
        template: &[String],
        input: &Path,
        output: Option<&Path>,
    ) -> Result<Vec<u8>, ExtractError> {
        let args = render_template(template, input, output);
        let (program, rest) = args.split_first().ok_or(ExtractError::EmptyCommand)?;

        debug!(program = %program, args = ?rest, "running extraction command");

        let result = Command::new(program)
            .args(rest)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ExtractError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !result.status.success() {
            return Err(ExtractError::Failed {
                program: program.clone(),
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        if let Some(path) = output {
            if !path.exists() {
                return Err(ExtractError::MissingOutput {
                    program: program.clone(),
                    path: path.to_path_buf(),
                });
            }
        }

        Ok(result.stdout)
    }
}

fn render_template(template: &[String], input: &Path, output: Option<&Path>) -> Vec<String> {
    let input = input.to_string_lossy();
    let output = output.map(|p| p.to_string_lossy()).unwrap_or_default();
    template
        .iter()
        .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
        .collect()
}

#[async_trait]
impl Extractor for CommandExtractor {
    async fn thumbnail(&self, source: &Path, output: &Path) -> Result<(), ExtractError> {
        self.run(&self.thumbnail, source, Some(output)).await?;
        Ok(())
    }

    async fn rasterize(&self, source: &Path, output: &Path) -> Result<PathBuf, ExtractError> {
        self.run(&self.rasterize, source, Some(output)).await?;
        Ok(output.to_path_buf())
    }

    async fn extract_text(&self, image: &Path) -> Result<String, ExtractError> {
        let stdout = self.run(&self.ocr, image, None).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}
