//! clamd (ClamAV daemon) client
//!
//! Talks the clamd TCP protocol directly: `zINSTREAM\0` followed by
//! length-prefixed chunks, terminated by a zero-length chunk. The daemon
//! answers one line, `stream: OK` or `stream: <signature> FOUND`.

use sirena_common::config::ClamdSettings;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CHUNK_SIZE: usize = 8192;
const CONNECT_TIMEOUT_SECS: u64 = 5;
const SCAN_TIMEOUT_SECS: u64 = 60;

/// clamd client errors
#[derive(Debug, Error)]
pub enum ClamdError {
    #[error("clamd unreachable: {0}")]
    Unreachable(String),

    #[error("clamd protocol error: {0}")]
    Protocol(String),

    #[error("clamd scan timed out")]
    Timeout,
}

/// Scan outcome for a clean or infected stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected(String),
}

/// clamd client
#[derive(Debug, Clone)]
pub struct ClamdClient {
    settings: ClamdSettings,
}

impl ClamdClient {
    pub fn new(settings: ClamdSettings) -> Self {
        Self { settings }
    }

    /// True when scanning is configured on
    pub fn enabled(&self) -> bool {
        !self.settings.disabled
    }

    /// Scan a byte buffer via INSTREAM
    pub async fn scan(&self, data: &[u8]) -> Result<ScanVerdict, ClamdError> {
        let address = format!("{}:{}", self.settings.host, self.settings.port);

        let connect = TcpStream::connect(&address);
        let mut stream = tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), connect)
            .await
            .map_err(|_| ClamdError::Timeout)?
            .map_err(|e| ClamdError::Unreachable(format!("{}: {}", address, e)))?;

        let exchange = async {
            stream.write_all(b"zINSTREAM\0").await?;

            for chunk in data.chunks(CHUNK_SIZE) {
                stream.write_all(&(chunk.len() as u32).to_be_bytes()).await?;
                stream.write_all(chunk).await?;
            }
            stream.write_all(&0u32.to_be_bytes()).await?;
            stream.flush().await?;

            let mut response = Vec::new();
            stream.read_to_end(&mut response).await?;
            Ok::<Vec<u8>, std::io::Error>(response)
        };

        let response = tokio::time::timeout(Duration::from_secs(SCAN_TIMEOUT_SECS), exchange)
            .await
            .map_err(|_| ClamdError::Timeout)?
            .map_err(|e| ClamdError::Unreachable(format!("{}: {}", address, e)))?;

        let response = String::from_utf8_lossy(&response);
        parse_scan_response(response.trim_end_matches('\0').trim())
    }
}

/// Parse a clamd INSTREAM response line
fn parse_scan_response(response: &str) -> Result<ScanVerdict, ClamdError> {
    if response.ends_with("OK") {
        return Ok(ScanVerdict::Clean);
    }

    if let Some(found) = response.strip_suffix(" FOUND") {
        let signature = found
            .rsplit_once(": ")
            .map(|(_, sig)| sig.to_string())
            .unwrap_or_else(|| found.to_string());
        return Ok(ScanVerdict::Infected(signature));
    }

    Err(ClamdError::Protocol(response.to_string()))
}
