//! Where playable audio comes from, and how it is brought into memory.

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::Client;
use url::Url;

use super::state::PlaybackError;
use crate::config::AudioConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackSource {
    File(PathBuf),
    Url(Url),
    /// Encoded audio already in memory. Must not be empty.
    Bytes(Bytes),
}

impl PlaybackSource {
    /// Interpret user input: `http(s)://` becomes a remote source, `file://`
    /// and bare paths become local files. Other schemes are rejected.
    pub fn parse(input: &str) -> Result<Self, PlaybackError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(PlaybackError::InvalidUrl("empty source".to_string()));
        }
        if !input.contains("://") {
            return Ok(PlaybackSource::File(PathBuf::from(input)));
        }

        let url =
            Url::parse(input).map_err(|e| PlaybackError::InvalidUrl(format!("{}: {}", input, e)))?;
        match url.scheme() {
            "http" | "https" if url.host_str().is_some_and(|h| !h.is_empty()) => {
                Ok(PlaybackSource::Url(url))
            }
            "http" | "https" => Err(PlaybackError::InvalidUrl(format!("{}: missing host", input))),
            "file" => url
                .to_file_path()
                .map(PlaybackSource::File)
                .map_err(|_| PlaybackError::InvalidUrl(format!("{}: not a local path", input))),
            other => Err(PlaybackError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            ))),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            PlaybackSource::File(path) => path.display().to_string(),
            PlaybackSource::Url(url) => url.to_string(),
            PlaybackSource::Bytes(bytes) => format!("<{} bytes in memory>", bytes.len()),
        }
    }

    /// File extension to help format probing.
    pub(crate) fn format_hint(&self) -> Option<String> {
        let ext = |path: &Path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
        };
        match self {
            PlaybackSource::File(path) => ext(path),
            PlaybackSource::Url(url) => ext(Path::new(url.path())),
            PlaybackSource::Bytes(_) => None,
        }
    }
}

impl From<PathBuf> for PlaybackSource {
    fn from(path: PathBuf) -> Self {
        PlaybackSource::File(path)
    }
}

impl From<Url> for PlaybackSource {
    fn from(url: Url) -> Self {
        PlaybackSource::Url(url)
    }
}

impl From<Bytes> for PlaybackSource {
    fn from(bytes: Bytes) -> Self {
        PlaybackSource::Bytes(bytes)
    }
}

/// Reads local files and downloads remote ones, one GET per request.
#[derive(Clone)]
pub(crate) struct SourceFetcher {
    client: Client,
    max_bytes: u64,
}

impl SourceFetcher {
    pub(crate) fn new(config: &AudioConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.transfer_timeout())
            .build()?;
        Ok(Self {
            client,
            max_bytes: config.max_download_bytes,
        })
    }

    pub(crate) async fn load(&self, source: &PlaybackSource) -> Result<Bytes, PlaybackError> {
        let data = match source {
            PlaybackSource::Bytes(bytes) => bytes.clone(),
            PlaybackSource::File(path) => tokio::fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|e| PlaybackError::LoadFailed(format!("{}: {}", path.display(), e)))?,
            PlaybackSource::Url(url) => self.download(url).await?,
        };
        if data.is_empty() {
            return Err(PlaybackError::InvalidData);
        }
        Ok(data)
    }

    async fn download(&self, url: &Url) -> Result<Bytes, PlaybackError> {
        log::info!("Downloading {}", url);
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(download_error)?;

        if !resp.status().is_success() {
            return Err(PlaybackError::DownloadFailed(format!(
                "HTTP Error: {}",
                resp.status()
            )));
        }
        if let Some(len) = resp.content_length() {
            if len > self.max_bytes {
                return Err(too_large(self.max_bytes));
            }
        }

        let capacity = resp.content_length().unwrap_or(0).min(self.max_bytes) as usize;
        let mut body = BytesMut::with_capacity(capacity);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(download_error)?;
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(too_large(self.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        log::info!("Downloaded {} bytes from {}", body.len(), url);
        Ok(body.freeze())
    }
}

fn download_error(err: reqwest::Error) -> PlaybackError {
    if err.is_timeout() {
        PlaybackError::DownloadFailed(format!("timed out: {}", err))
    } else {
        PlaybackError::DownloadFailed(err.to_string())
    }
}

fn too_large(limit: u64) -> PlaybackError {
    PlaybackError::DownloadFailed(format!("response exceeds {} bytes", limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sources() {
        assert_eq!(
            PlaybackSource::parse("/tmp/a.wav").unwrap(),
            PlaybackSource::File(PathBuf::from("/tmp/a.wav"))
        );
        assert_eq!(
            PlaybackSource::parse("file:///tmp/b.mp3").unwrap(),
            PlaybackSource::File(PathBuf::from("/tmp/b.mp3"))
        );
        match PlaybackSource::parse("https://cdn.example.com/clips/c.m4a?sig=1").unwrap() {
            PlaybackSource::Url(url) => assert_eq!(url.host_str(), Some("cdn.example.com")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_urls() {
        for input in ["", "   ", "http://", "ftp://example.com/a.wav", "https://exa mple.com/"] {
            assert!(
                matches!(PlaybackSource::parse(input), Err(PlaybackError::InvalidUrl(_))),
                "{:?} accepted",
                input
            );
        }
    }

    #[test]
    fn format_hint_comes_from_the_path() {
        let url = PlaybackSource::parse("https://example.com/x/Clip.MP3?token=abc").unwrap();
        assert_eq!(url.format_hint().as_deref(), Some("mp3"));
        let file = PlaybackSource::File(PathBuf::from("take.wav"));
        assert_eq!(file.format_hint().as_deref(), Some("wav"));
        assert_eq!(PlaybackSource::Bytes(Bytes::from_static(b"x")).format_hint(), None);
    }

    #[tokio::test]
    async fn empty_bytes_are_invalid_data() {
        let fetcher = SourceFetcher::new(&AudioConfig::default()).unwrap();
        assert_eq!(
            fetcher.load(&PlaybackSource::Bytes(Bytes::new())).await,
            Err(PlaybackError::InvalidData)
        );
    }

    #[tokio::test]
    async fn missing_file_is_a_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = SourceFetcher::new(&AudioConfig::default()).unwrap();
        let source = PlaybackSource::File(dir.path().join("absent.wav"));
        assert!(matches!(
            fetcher.load(&source).await,
            Err(PlaybackError::LoadFailed(_))
        ));
    }
}
