use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::{Proxy, StatusCode};
use thiserror::Error;

/// Size of the buffer used when streaming a response body to disk.
const CHUNK_SIZE: usize = 64 * 1024;

/// Scheme (`http`, `https` or `all`) to proxy URL.
pub(crate) type Proxies = BTreeMap<String, String>;

/// Failures of a single HTTP request.
#[derive(Error, Debug)]
pub(crate) enum FetchError {
    #[error("access denied (403 Forbidden)")]
    Forbidden,

    #[error("not found (404 Not Found)")]
    NotFound,

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("response body interrupted: {0}")]
    Stream(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FetchError {
    /// A terminal failure is not worth another attempt at the same URL.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, FetchError::Forbidden)
    }

    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchError::Timeout(error.to_string())
        } else {
            FetchError::Connection(error.to_string())
        }
    }

    fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::FORBIDDEN => FetchError::Forbidden,
            StatusCode::NOT_FOUND => FetchError::NotFound,
            other => FetchError::Status(other.as_u16()),
        }
    }
}

/// The HTTP operations the crawler needs. Shared by the page walker and every
/// download worker.
pub(crate) trait HttpSender: Send + Sync {
    /// Fetches a whole listing page.
    fn get_page(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    /// Streams the body behind `url` into `sink` and returns the number of bytes written.
    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError>;
}

/// [HttpSender] backed by a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub(crate) struct RequestSender {
    client: Client,
}

impl RequestSender {
    /// Builds the shared client. `timeout` applies to every attempt independently.
    pub(crate) fn new(timeout: Duration, proxies: Option<&Proxies>) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder()
            .user_agent(format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(timeout);

        if let Some(proxies) = proxies {
            for (scheme, url) in proxies {
                let proxy = match scheme.as_str() {
                    "http" => Proxy::http(url)?,
                    "https" => Proxy::https(url)?,
                    "all" => Proxy::all(url)?,
                    other => {
                        warn!("Ignoring proxy for unsupported scheme \"{}\"", other);
                        continue;
                    }
                };
                trace!("Using {} proxy {}", scheme, url);
                builder = builder.proxy(proxy);
            }
        }

        Ok(RequestSender {
            client: builder.build()?,
        })
    }
}

impl HttpSender for RequestSender {
    fn get_page(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().map_err(FetchError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }

        let bytes = response.bytes().map_err(FetchError::from_reqwest)?;
        Ok(bytes.to_vec())
    }

    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
        let mut response = self.client.get(url).send().map_err(FetchError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            let read = match response.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(FetchError::Timeout(e.to_string()));
                }
                Err(e) => return Err(FetchError::Stream(e.to_string())),
            };
            sink.write_all(&buffer[..read])?;
            written += read as u64;
        }

        Ok(written)
    }
}
