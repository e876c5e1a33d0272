//! Reads the image being tagged and packs it into a data URL for the
//! predict request body.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::utils::expand_tilde;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Url;
use std::path::PathBuf;
use tracing::debug;

const FALLBACK_MIME: &str = "application/octet-stream";

/// Raw image bytes plus whatever content type the source declared
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FetchedImage {
    /// Sniffed mime type, falling back to the declared one
    pub fn mime_type(&self) -> &str {
        if let Ok(format) = image::guess_format(&self.bytes) {
            return format.to_mime_type();
        }
        self.content_type
            .as_deref()
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
            .filter(|ct| ct.starts_with("image/"))
            .unwrap_or(FALLBACK_MIME)
    }

    /// `data:<mime>;base64,<payload>`
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), STANDARD.encode(&self.bytes))
    }
}

enum ImageSource {
    Remote(Url),
    Inline { mime: Option<String>, payload: String },
    Local(PathBuf),
}

impl ImageSource {
    fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(Error::Image("no image to tag".to_string()));
        }

        if let Some(rest) = source.strip_prefix("data:") {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| Error::Image("malformed data URL".to_string()))?;
            let mime = header.strip_suffix(";base64").ok_or_else(|| {
                Error::Image("only base64 data URLs are supported".to_string())
            })?;
            return Ok(ImageSource::Inline {
                mime: Some(mime.to_string()).filter(|m| !m.is_empty()),
                payload: payload.to_string(),
            });
        }

        match Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(ImageSource::Remote(url)),
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(ImageSource::Local)
                .map_err(|_| Error::Image(format!("invalid file URL {}", source))),
            // Single-letter schemes are Windows drive letters
            Ok(url) if url.scheme().len() > 1 => Err(Error::Image(format!(
                "unsupported image URL scheme '{}'",
                url.scheme()
            ))),
            _ => Ok(ImageSource::Local(expand_tilde(source))),
        }
    }
}

pub struct ImageFetcher {
    http: reqwest::Client,
}

impl Default for ImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Read an image from an http(s) URL, a `file://` URL, a base64 data URL
    /// or a local path.
    ///
    /// Remote hosts must pass `config.image_hosts`. Remote and local reads are
    /// both bounded by `config.request_timeout()`. Every failure is an
    /// [`Error::Image`] so callers can tell it apart from AI errors.
    pub async fn fetch(&self, source: &str, config: &Config) -> Result<FetchedImage> {
        let image = match ImageSource::parse(source)? {
            ImageSource::Remote(url) => self.fetch_remote(url, config).await?,
            ImageSource::Inline { mime, payload } => FetchedImage {
                bytes: STANDARD
                    .decode(payload.trim())
                    .map_err(|e| Error::Image(format!("invalid base64 payload: {}", e)))?,
                content_type: mime,
            },
            ImageSource::Local(path) => {
                let timeout = config.request_timeout();
                let bytes = tokio::time::timeout(timeout, tokio::fs::read(&path))
                    .await
                    .map_err(|_| {
                        Error::Image(format!(
                            "reading {} timed out after {}ms",
                            path.display(),
                            timeout.as_millis()
                        ))
                    })?
                    .map_err(|e| Error::Image(format!("{}: {}", path.display(), e)))?;
                FetchedImage {
                    bytes,
                    content_type: None,
                }
            }
        };

        if image.bytes.is_empty() {
            return Err(Error::Image("image is empty".to_string()));
        }

        debug!(size = image.bytes.len(), mime = image.mime_type(), "Image fetched");
        Ok(image)
    }

    /// Fetch and encode in one step
    pub async fn fetch_data_url(&self, source: &str, config: &Config) -> Result<String> {
        Ok(self.fetch(source, config).await?.to_data_url())
    }

    async fn fetch_remote(&self, url: Url, config: &Config) -> Result<FetchedImage> {
        let host = url.host_str().unwrap_or_default();
        if !config.allows_image_host(host) {
            return Err(Error::Image(format!(
                "host '{}' is not in the allowed image hosts",
                host
            )));
        }

        let timeout = config.request_timeout();
        let to_image_error = |e: reqwest::Error| {
            if e.is_timeout() {
                Error::Image("image fetch timed out".to_string())
            } else {
                Error::Image(e.to_string())
            }
        };

        let response = self
            .http
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(to_image_error)?;

        if !response.status().is_success() {
            return Err(Error::Image(format!("{} returned {}", url, response.status())));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(to_image_error)?;

        Ok(FetchedImage {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}
