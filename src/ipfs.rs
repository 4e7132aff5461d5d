//! Content-addressed storage through the IPFS HTTP API.

use log::debug;
use reqwest::blocking::multipart::Form;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::error::Error as StdError;
use std::fmt;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// IPFS errors
#[derive(Debug)]
pub enum IpfsError {
    /// HTTP request failed
    Http(reqwest::Error),
    /// API answered with an error status
    Status { status: u16, message: String },
    /// Reading a local file failed
    Io(io::Error),
    /// API response could not be understood
    Parse(String),
    /// API address is neither a multiaddr nor an http(s) URL
    InvalidAddress(String),
}

impl fmt::Display for IpfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpfsError::Http(err) => write!(f, "HTTP error: {}", err),
            IpfsError::Status { status, message } => {
                write!(f, "IPFS API returned {}: {}", status, message)
            }
            IpfsError::Io(err) => write!(f, "I/O error: {}", err),
            IpfsError::Parse(msg) => write!(f, "Invalid IPFS response: {}", msg),
            IpfsError::InvalidAddress(addr) => write!(f, "Invalid IPFS API address: {}", addr),
        }
    }
}

impl StdError for IpfsError {}

impl From<reqwest::Error> for IpfsError {
    fn from(err: reqwest::Error) -> Self {
        IpfsError::Http(err)
    }
}

impl From<io::Error> for IpfsError {
    fn from(err: io::Error) -> Self {
        IpfsError::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, IpfsError>;

/// One line of an `add` response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddedEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Hash")]
    pub hash: String,
}

/// Content-addressed storage used by the uploader
pub trait ContentStore: Send + Sync {
    /// Add files wrapped in a directory. The result has one entry per file
    /// plus one with an empty name for the directory itself.
    fn add_directory(&self, files: &[PathBuf]) -> Result<Vec<AddedEntry>>;

    fn add_file(&self, file: &Path) -> Result<AddedEntry>;

    /// Largest request body the store accepts, in bytes
    fn request_size_limit(&self) -> u64;
}

/// Turn an API address into a base URL.
///
/// Accepts multiaddrs such as `/dns/ipfs.infura.io/tcp/5001/https` or
/// `/ip4/127.0.0.1/tcp/5001` (plain http) as well as http(s) URLs.
pub fn api_base_url(address: &str) -> Result<Url> {
    let invalid = || IpfsError::InvalidAddress(address.to_string());

    if address.starts_with("http://") || address.starts_with("https://") {
        return Url::parse(address).map_err(|_| invalid());
    }

    let parts: Vec<&str> = address.trim_matches('/').split('/').collect();
    let (host, port, scheme) = match parts.as_slice() {
        [kind, host, "tcp", port] if is_host_protocol(kind) => (*host, *port, "http"),
        [kind, host, "tcp", port, scheme @ ("http" | "https")] if is_host_protocol(kind) => {
            (*host, *port, *scheme)
        }
        _ => return Err(invalid()),
    };
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let host = if parts[0] == "ip6" {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    Url::parse(&format!("{}://{}:{}/", scheme, host, port)).map_err(|_| invalid())
}

fn is_host_protocol(kind: &str) -> bool {
    matches!(kind, "dns" | "dns4" | "dns6" | "ip4" | "ip6")
}

/// Public gateway URL with `{cid}` and `{path}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayTemplate {
    template: String,
}

impl GatewayTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn url(&self, cid: &str, path: &str) -> String {
        self.template.replace("{cid}", cid).replace("{path}", path)
    }
}

/// Blocking client of the IPFS HTTP API
pub struct IpfsClient {
    client: Client,
    add_url: Url,
    request_size_limit: u64,
}

impl IpfsClient {
    pub fn new(address: &str, timeout: Duration, request_size_limit: u64) -> Result<Self> {
        let base = api_base_url(address)?;
        let add_url = base
            .join("api/v0/add")
            .map_err(|_| IpfsError::InvalidAddress(address.to_string()))?;
        let client = Client::builder().timeout(timeout).build()?;
        debug!("Using IPFS API at {}", add_url);
        Ok(Self {
            client,
            add_url,
            request_size_limit,
        })
    }

    fn add(&self, files: &[PathBuf], wrap_with_directory: bool) -> Result<Vec<AddedEntry>> {
        let mut form = Form::new();
        for file in files {
            form = form.file("file", file)?;
        }

        let wrap = if wrap_with_directory { "true" } else { "false" };
        let response = self
            .client
            .post(self.add_url.clone())
            .query(&[
                ("wrap-with-directory", wrap),
                ("trickle", "true"),
                ("cid-version", "1"),
            ])
            .multipart(form)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(IpfsError::Status {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }

        parse_add_response(io::BufReader::new(response))
    }
}

/// Parse the newline-delimited JSON body of an `add` call
pub fn parse_add_response<R: BufRead>(reader: R) -> Result<Vec<AddedEntry>> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AddedEntry =
            serde_json::from_str(&line).map_err(|e| IpfsError::Parse(format!("{}: {}", e, line)))?;
        entries.push(entry);
    }
    Ok(entries)
}

impl ContentStore for IpfsClient {
    fn add_directory(&self, files: &[PathBuf]) -> Result<Vec<AddedEntry>> {
        self.add(files, true)
    }

    fn add_file(&self, file: &Path) -> Result<AddedEntry> {
        self.add(&[file.to_path_buf()], false)?
            .pop()
            .ok_or_else(|| IpfsError::Parse("empty response".to_string()))
    }

    fn request_size_limit(&self) -> u64 {
        self.request_size_limit
    }
}
