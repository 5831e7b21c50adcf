//! Capture stream client.

use std::fmt;
use std::io;

use futures::TryStreamExt;
use reqwest::Url;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::agent::CAPTURE_PATH;
use crate::error::{ConfigError, StreamError};
use crate::stream::TlsSettings;

/// A validated agent URL.
///
/// Only http and https targets are accepted. A bare `http://host:8475` gets
/// the capture endpoint appended; an explicit path, query included, passes
/// through untouched so per-agent filters can ride on the URL.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    url: Url,
}

impl RemoteTarget {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut url = Url::parse(raw).map_err(|e| ConfigError::InvalidTarget {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ConfigError::UnsupportedScheme {
                    scheme: other.to_string(),
                    url: raw.to_string(),
                })
            }
        }
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(CAPTURE_PATH);
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// HTTP client shared by all agent connections.
#[derive(Clone)]
pub struct StreamClient {
    http: reqwest::Client,
}

impl StreamClient {
    pub fn new(tls: &TlsSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            http: tls.build_client()?,
        })
    }

    /// Open one capture stream.
    ///
    /// Returns once the agent has committed its response status; the stream
    /// stays open until the returned reader is dropped.
    pub async fn open(
        &self,
        target: &RemoteTarget,
    ) -> Result<impl AsyncRead + Send + Unpin, StreamError> {
        let response = self
            .http
            .get(target.url().clone())
            .send()
            .await?
            .error_for_status()?;
        tracing::debug!("connected to {}", target);
        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(StreamReader::new(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_appends_capture_path() {
        let target = RemoteTarget::parse("http://10.0.0.1:8475").unwrap();
        assert_eq!(target.to_string(), "http://10.0.0.1:8475/capture");
    }

    #[test]
    fn test_parse_keeps_explicit_path_and_query() {
        let target = RemoteTarget::parse("https://agent.example:9000/capture?filter=port+53").unwrap();
        assert_eq!(
            target.to_string(),
            "https://agent.example:9000/capture?filter=port+53"
        );
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        let err = RemoteTarget::parse("ftp://agent.example/capture").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported scheme 'ftp' in target url 'ftp://agent.example/capture'"
        );
    }

    #[test]
    fn test_parse_rejects_bare_host_port() {
        // Without a scheme the host parses as one, which is never http.
        let err = RemoteTarget::parse("localhost:8475").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnsupportedScheme { ref scheme, .. } if scheme == "localhost"
        ));

        // A numeric host cannot even pass for a scheme.
        assert!(matches!(
            RemoteTarget::parse("10.0.0.1:8475"),
            Err(ConfigError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            RemoteTarget::parse("not a url"),
            Err(ConfigError::InvalidTarget { .. })
        ));
    }
}
