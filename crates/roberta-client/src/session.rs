//! Server session: push protocol and binary downloads

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};
use roberta_core::{DeviceInfo, FirmwareFile};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::address::{candidate_urls, ServerAddress};
use crate::error::{ClientError, Result};
use crate::types::{Download, PushResponse};

/// Default connection timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout; the server holds push requests open
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Name of the response header carrying the artifact name
pub const FILENAME_HEADER: &str = "Filename";

const PUSH_PATH: &str = "/rest/pushcmd";
const DOWNLOAD_PATH: &str = "/rest/download";
const UPDATE_PATH: &str = "/rest/update";

/// Client for the programming server
///
/// Holds no state besides the shared [`ServerAddress`]; every call takes a
/// snapshot of the address before it starts.
#[derive(Debug, Clone)]
pub struct ServerSession {
    client: Client,
    address: Arc<ServerAddress>,
}

impl ServerSession {
    /// Create a session with the default 5s connect / 300s read timeouts
    pub fn new(address: Arc<ServerAddress>) -> Result<Self> {
        Self::with_config(address, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }

    /// Create a session with custom timeouts
    ///
    /// `read_timeout` bounds each wait for data rather than the whole
    /// exchange, so a slow but live download is not cut off.
    pub fn with_config(
        address: Arc<ServerAddress>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_CHARSET, HeaderValue::from_static("UTF-8"));

        let client = Client::builder()
            .read_timeout(read_timeout)
            .connect_timeout(connect_timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self { client, address })
    }

    /// The shared server address
    pub fn address(&self) -> &Arc<ServerAddress> {
        &self.address
    }

    // =========================================================================
    // Push Protocol
    // =========================================================================

    /// POST the device info to `/rest/pushcmd` and return the server's answer
    ///
    /// The server may hold the request open for several seconds.
    #[instrument(skip(self, info), fields(cmd = info.get(DeviceInfo::CMD).unwrap_or("")))]
    pub async fn push(&self, info: &DeviceInfo) -> Result<PushResponse> {
        let response = self
            .send(PUSH_PATH, |client, url| {
                client
                    .post(url)
                    .header(header::ACCEPT, "application/json")
                    .json(info)
            })
            .await?;

        let push: PushResponse = self.handle_response(response).await?;
        debug!(cmd = %push.cmd, "Push answered");
        Ok(push)
    }

    // =========================================================================
    // Downloads
    // =========================================================================

    /// POST the device info to `/rest/download` and return the compiled program
    #[instrument(skip(self, info))]
    pub async fn download_program(&self, info: &DeviceInfo) -> Result<Download> {
        let response = self
            .send(DOWNLOAD_PATH, |client, url| {
                client
                    .post(url)
                    .header(header::ACCEPT, "application/octet-stream")
                    .json(info)
            })
            .await?;

        let download = self.handle_binary(response).await?;
        debug!(filename = %download.filename, size = download.bytes.len(), "Program downloaded");
        Ok(download)
    }

    /// GET a runtime file from `/rest/update/<name>`
    #[instrument(skip(self))]
    pub async fn download_firmware_file(&self, name: &str) -> Result<FirmwareFile> {
        let path = format!("{}/{}", UPDATE_PATH, name);
        let response = self
            .send(&path, |client, url| {
                client
                    .get(url)
                    .header(header::ACCEPT, "application/octet-stream")
            })
            .await?;

        let download = self.handle_binary(response).await?;
        Ok(FirmwareFile {
            name: name.to_string(),
            bytes: download.bytes,
        })
    }

    /// Checksum of the HAL archive published for a NAO firmware version
    #[instrument(skip(self))]
    pub async fn hal_checksum(&self, firmware: &str) -> Result<String> {
        let path = format!("{}/{}/hal/checksum", UPDATE_PATH, firmware);
        let response = self.send(&path, |client, url| client.get(url)).await?;

        if !response.status().is_success() {
            return Err(self.extract_error(response).await);
        }
        let text = response.text().await?;
        let checksum = text.lines().next().unwrap_or("").trim().to_string();
        if checksum.is_empty() {
            return Err(ClientError::ParseError("empty HAL checksum".to_string()));
        }
        Ok(checksum)
    }

    /// Download the NAO HAL archive (zip)
    #[instrument(skip(self))]
    pub async fn download_hal(&self, firmware: &str) -> Result<Vec<u8>> {
        let path = format!("/update/nao/{}/hal", firmware);
        let response = self
            .send(&path, |client, url| {
                client
                    .get(url)
                    .header(header::ACCEPT, "application/octet-stream")
            })
            .await?;

        if !response.status().is_success() {
            return Err(self.extract_error(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    // =========================================================================
    // Helper Methods
    // =========================================================================

    /// Send a request, falling back from TLS to plain HTTP once
    async fn send<F>(&self, path: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client, Url) -> RequestBuilder,
    {
        let address = self.address.current();
        let mut bases = candidate_urls(&address)?.into_iter().peekable();

        while let Some(base) = bases.next() {
            let url = base.join(path)?;
            match build(&self.client, url.clone()).send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() && bases.peek().is_some() => {
                    warn!(%url, error = %e, "Connection failed, retrying without TLS");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ClientError::InvalidAddress(address))
    }

    /// Handle JSON response, checking for errors
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: Response,
    ) -> Result<T> {
        if response.status().is_success() {
            let body = response.text().await?;
            serde_json::from_str(&body).map_err(|e| ClientError::ParseError(e.to_string()))
        } else {
            Err(self.extract_error(response).await)
        }
    }

    /// Handle binary response carrying a `Filename` header
    async fn handle_binary(&self, response: Response) -> Result<Download> {
        if !response.status().is_success() {
            return Err(self.extract_error(response).await);
        }

        let filename = response
            .headers()
            .get(FILENAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(ClientError::MissingHeader(FILENAME_HEADER))?;
        let bytes = response.bytes().await?.to_vec();

        Ok(Download { filename, bytes })
    }

    /// Extract error from failed response
    async fn extract_error(&self, response: Response) -> ClientError {
        let status = response.status();
        let message = match response.text().await {
            Ok(body) if !body.trim().is_empty() => body.trim().to_string(),
            _ => format!("HTTP {}", status),
        };
        ClientError::server_error(status.as_u16(), message)
    }
}
