//! Server address selection

use parking_lot::RwLock;
use url::Url;

use crate::error::{ClientError, Result};

/// Default programming server
pub const DEFAULT_SERVER_ADDRESS: &str = "lab.open-roberta.org";

/// Process wide server address (default vs. custom)
///
/// Writers are UI or CLI threads; readers take a snapshot with
/// [`ServerAddress::current`] at the start of every round-trip.
#[derive(Debug)]
pub struct ServerAddress {
    default: String,
    custom: RwLock<Option<String>>,
}

impl ServerAddress {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            custom: RwLock::new(None),
        }
    }

    pub fn with_custom(default: impl Into<String>, custom: Option<String>) -> Self {
        let address = Self::new(default);
        if let Some(custom) = custom {
            address.set_custom(custom);
        }
        address
    }

    /// Address used for the next request
    pub fn current(&self) -> String {
        self.custom
            .read()
            .clone()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn default_address(&self) -> &str {
        &self.default
    }

    pub fn is_custom(&self) -> bool {
        self.custom.read().is_some()
    }

    /// Switch to a custom address; blank input is ignored
    pub fn set_custom(&self, address: impl Into<String>) {
        let address = address.into().trim().to_string();
        if address.is_empty() {
            return;
        }
        *self.custom.write() = Some(address);
    }

    pub fn reset_to_default(&self) {
        *self.custom.write() = None;
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_ADDRESS)
    }
}

/// Base URLs to try for an address, in order
///
/// An explicit scheme is used as given. Addresses naming `localhost` are
/// plain HTTP. Anything else is tried over TLS first with one fallback to
/// plain HTTP.
pub fn candidate_urls(address: &str) -> Result<Vec<Url>> {
    let address = address.trim().trim_end_matches('/');
    if address.is_empty() {
        return Err(ClientError::InvalidAddress(address.to_string()));
    }

    if address.contains("://") {
        return Ok(vec![Url::parse(address)?]);
    }

    if address.contains("localhost") {
        return Ok(vec![Url::parse(&format!("http://{}", address))?]);
    }

    Ok(vec![
        Url::parse(&format!("https://{}", address))?,
        Url::parse(&format!("http://{}", address))?,
    ])
}
