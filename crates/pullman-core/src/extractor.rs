//! External media extractor
//!
//! Media-site resolution is delegated to a user-configured command
//! (yt-dlp or similar). The contract: the command gets the page URL as
//! its last argument and prints one JSON object on stdout with the
//! direct media URL; the engine then downloads it like any HTTP
//! transfer.

use crate::error::PullmanError;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// How long the external command may run before it is killed.
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(120);

/// What the extractor command must print on stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedMedia {
    /// Direct, downloadable media URL
    pub url: String,
    pub title: String,
    pub ext: String,
    #[serde(default)]
    pub filesize: Option<u64>,
}

impl ExtractedMedia {
    pub fn file_name(&self) -> String {
        format!("{}.{}", sanitize(&self.title), self.ext)
    }
}

pub struct MediaExtractor {
    command: String,
}

impl MediaExtractor {
    pub fn new(command: String) -> Self {
        Self { command }
    }

    /// Resolve a page URL to a direct media URL.
    pub async fn extract(&self, page_url: &str) -> Result<ExtractedMedia, PullmanError> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| PullmanError::Extractor("extractor command is empty".into()))?;

        info!("Running extractor for {}", page_url);

        let child = Command::new(program)
            .args(parts)
            .arg(page_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PullmanError::Extractor(format!("could not spawn {}: {}", program, e)))?;

        let output = tokio::time::timeout(EXTRACT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| PullmanError::Extractor("extractor timed out".into()))?
            .map_err(PullmanError::Io)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PullmanError::Extractor(format!(
                "extractor exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        // Tolerate banner noise before and after: take the first line
        // that opens a JSON object and parse the leading value off it.
        let media = stdout
            .lines()
            .filter(|l| l.trim_start().starts_with('{'))
            .find_map(|l| {
                serde_json::Deserializer::from_str(l.trim_start())
                    .into_iter::<ExtractedMedia>()
                    .next()
                    .and_then(|r| r.ok())
            })
            .ok_or_else(|| {
                PullmanError::Extractor("extractor printed no parseable media object".into())
            })?;

        if media.url.is_empty() {
            return Err(PullmanError::Extractor("extractor returned an empty URL".into()));
        }

        debug!("Extractor resolved {} -> {}", page_url, media.url);
        Ok(media)
    }
}

/// Strip path separators and control characters from a title.
fn sanitize(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "media".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_json_from_stdout() {
        // echo ignores the appended page URL, so the JSON rides in the
        // command itself.
        let media = MediaExtractor::new(
            r#"echo {"url":"https://cdn.example.com/v.mp4","title":"clip","ext":"mp4","filesize":1024}"#
                .into(),
        )
        .extract("https://example.com/watch?v=1")
        .await
        .unwrap();

        assert_eq!(media.url, "https://cdn.example.com/v.mp4");
        assert_eq!(media.filesize, Some(1024));
        assert_eq!(media.file_name(), "clip.mp4");
    }

    #[tokio::test]
    async fn missing_program_is_an_extractor_error() {
        let extractor = MediaExtractor::new("definitely-not-a-real-binary-xyz".into());
        let err = extractor.extract("https://example.com/x").await.unwrap_err();
        assert!(matches!(err, PullmanError::Extractor(_)));
    }

    #[tokio::test]
    async fn garbage_output_is_an_extractor_error() {
        let extractor = MediaExtractor::new("echo not-json-at-all".into());
        let err = extractor.extract("https://example.com/x").await.unwrap_err();
        assert!(matches!(err, PullmanError::Extractor(_)));
    }

    #[test]
    fn titles_are_sanitized_for_the_filesystem() {
        assert_eq!(sanitize("a/b:c*d"), "a_b_c_d");
        assert_eq!(sanitize("   "), "media");
    }
}
