use std::io::Read;

use log::{debug, info, warn};
use thiserror::Error;

use crate::{codec, types::Snapshot};

pub const HEADER_M5_DETAILS: &str = "M5-Details";
pub const HEADER_USER_ID: &str = "USER-ID";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_DISPOSITION: &str = "Content-Disposition";
pub const CONTENT_TYPE_TEXT_PLAIN: &str = "text/plain";

pub const STATUS_OK: i32 = 200;
pub const STATUS_TRANSPORT_ERROR: i32 = -1;

pub fn is_success(status: i32) -> bool {
    status == STATUS_OK
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("i/o error while talking to {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Other(String),
}

/// Ordered header list; duplicates are kept and names are sent as given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub url: String,
    pub headers: Headers,
}

impl RequestDescriptor {
    pub fn new(url: impl Into<String>, headers: Headers) -> Self {
        Self {
            url: url.into(),
            headers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: i32,
    pub body: String,
}

pub trait HttpTransport {
    fn get(&mut self, request: &RequestDescriptor) -> Result<RawResponse, TransportError>;

    fn post(
        &mut self,
        request: &RequestDescriptor,
        body: &mut dyn Read,
    ) -> Result<RawResponse, TransportError>;
}

impl<T: HttpTransport + ?Sized> HttpTransport for &mut T {
    fn get(&mut self, request: &RequestDescriptor) -> Result<RawResponse, TransportError> {
        (**self).get(request)
    }

    fn post(
        &mut self,
        request: &RequestDescriptor,
        body: &mut dyn Read,
    ) -> Result<RawResponse, TransportError> {
        (**self).post(request, body)
    }
}

pub fn get_with_headers<T: HttpTransport + ?Sized>(
    transport: &mut T,
    request: &RequestDescriptor,
) -> i32 {
    match transport.get(request) {
        Ok(response) => {
            debug!("GET {} -> {}: {}", request.url, response.status, response.body);
            response.status
        }
        Err(err) => {
            warn!("GET {} failed: {err}", request.url);
            STATUS_TRANSPORT_ERROR
        }
    }
}

pub fn get_latest_with_headers<T: HttpTransport + ?Sized>(
    transport: &mut T,
    request: &RequestDescriptor,
) -> (i32, Option<Snapshot>) {
    let response = match transport.get(request) {
        Ok(response) => response,
        Err(err) => {
            warn!("GET {} failed: {err}", request.url);
            return (STATUS_TRANSPORT_ERROR, None);
        }
    };

    debug!("GET {} -> {}: {}", request.url, response.status, response.body);
    if !is_success(response.status) {
        return (response.status, None);
    }

    match codec::decode_snapshot_response(&response.body) {
        Ok(snapshot) => {
            info!(
                "retrieved snapshot captured at {} (cloud time {})",
                snapshot.time_captured, snapshot.cloud_upload_time
            );
            (response.status, Some(snapshot))
        }
        Err(err) => {
            warn!("discarding retrieval body from {}: {err}", request.url);
            (response.status, None)
        }
    }
}

pub fn post_file<T: HttpTransport + ?Sized>(
    transport: &mut T,
    request: &RequestDescriptor,
    file: &mut dyn Read,
) -> i32 {
    match transport.post(request, file) {
        Ok(response) => {
            info!("HTTP code: {}", response.status);
            debug!("POST {} body: {}", request.url, response.body);
            response.status
        }
        Err(err) => {
            warn!("HTTP error code: {STATUS_TRANSPORT_ERROR} ({err})");
            STATUS_TRANSPORT_ERROR
        }
    }
}
