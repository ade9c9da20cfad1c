//! Proxmox VE REST client
//!
//! Talks to `/api2/json` on a single node using an API token. Nodes usually
//! run with self-signed certificates, so certificate verification can be
//! turned off per client.

use std::time::Duration;

use reqwest::{Client, Method};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, instrument};
use url::Url;

use crate::error::{HypervisorError, Result};

const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const POWER_TIMEOUT: Duration = Duration::from_secs(30);
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Guest flavour, which selects the API path segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestKind {
    Qemu,
    Lxc,
}

impl GuestKind {
    #[must_use]
    pub fn as_path(self) -> &'static str {
        match self {
            GuestKind::Qemu => "qemu",
            GuestKind::Lxc => "lxc",
        }
    }
}

/// Address of one guest on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestRef {
    pub node: String,
    pub kind: GuestKind,
    pub vmid: u32,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct GuestStatus {
    #[serde(default)]
    status: Option<String>,
}

/// HTTP client for one Proxmox node
#[derive(Clone)]
pub struct ProxmoxClient {
    client: Client,
    base_url: Url,
    authorization: String,
}

impl std::fmt::Debug for ProxmoxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxmoxClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl ProxmoxClient {
    /// Create a client for `https://{node_address}/api2/json`
    ///
    /// # Errors
    /// Returns an error if the address does not form a valid URL or the
    /// TLS backend cannot be initialised.
    pub fn new(node_address: &str, api_token: &str, accept_invalid_certs: bool) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        let base_url = Url::parse(&format!("https://{node_address}/api2/json"))?;
        Ok(Self::with_client(base_url, api_token, client))
    }

    /// Create a client with a custom base URL and `reqwest::Client`
    #[must_use]
    pub fn with_client(base_url: Url, api_token: &str, client: Client) -> Self {
        Self {
            client,
            base_url,
            authorization: authorization_header(api_token),
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| HypervisorError::InvalidResponse("base URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn guest_url(&self, guest: &GuestRef, action: &[&str]) -> Result<Url> {
        let vmid = guest.vmid.to_string();
        let mut segments = vec!["nodes", guest.node.as_str(), guest.kind.as_path(), vmid.as_str()];
        segments.extend_from_slice(action);
        self.url(&segments)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        timeout: Duration,
    ) -> Result<T> {
        debug!(%method, url = %url, "proxmox request");

        let response = self
            .client
            .request(method, url.clone())
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .timeout(timeout)
            .send()
            .await
            .map_err(HypervisorError::from_reqwest)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            error!(status, url = %url, message = %message, "proxmox API error");
            return Err(HypervisorError::Api { status, message });
        }

        let envelope: Envelope<T> = response.json().await.map_err(HypervisorError::from_reqwest)?;
        Ok(envelope.data)
    }

    /// Node API version, used as a connectivity and credentials check
    ///
    /// # Errors
    /// Returns an error if the node is unreachable or rejects the token.
    #[instrument(skip(self), fields(base = %self.base_url))]
    pub async fn version(&self) -> Result<Value> {
        let url = self.url(&["version"])?;
        self.send(Method::GET, url, VERSION_TIMEOUT).await
    }

    /// Current power status string (`running`, `stopped`, ...)
    ///
    /// # Errors
    /// Returns an error if the request fails or the guest does not exist.
    #[instrument(skip(self), fields(base = %self.base_url))]
    pub async fn guest_status(&self, guest: &GuestRef) -> Result<String> {
        let url = self.guest_url(guest, &["status", "current"])?;
        let status: GuestStatus = self.send(Method::GET, url, STATUS_TIMEOUT).await?;
        Ok(status.status.unwrap_or_else(|| "unknown".to_string()))
    }

    /// Request guest start; returns the node's task id (UPID)
    ///
    /// # Errors
    /// Returns an error if the node rejects the request.
    #[instrument(skip(self), fields(base = %self.base_url))]
    pub async fn start(&self, guest: &GuestRef) -> Result<Value> {
        let url = self.guest_url(guest, &["status", "start"])?;
        self.send(Method::POST, url, POWER_TIMEOUT).await
    }

    /// Request guest stop; returns the node's task id (UPID)
    ///
    /// # Errors
    /// Returns an error if the node rejects the request.
    #[instrument(skip(self), fields(base = %self.base_url))]
    pub async fn stop(&self, guest: &GuestRef) -> Result<Value> {
        let url = self.guest_url(guest, &["status", "stop"])?;
        self.send(Method::POST, url, POWER_TIMEOUT).await
    }
}

/// `PVEAPIToken=user@realm!tokenid=secret`, adding the scheme prefix when missing
fn authorization_header(api_token: &str) -> String {
    let token = api_token.trim();
    if token.starts_with("PVEAPIToken=") {
        token.to_string()
    } else {
        format!("PVEAPIToken={token}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve one canned HTTP response and hand back the raw request
    async fn serve_once(status_line: &'static str, body: &'static str) -> (Url, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut request = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).to_string());
        });

        let url = Url::parse(&format!("http://{addr}/api2/json")).unwrap();
        (url, rx)
    }

    fn guest() -> GuestRef {
        GuestRef {
            node: "pve 1".to_string(),
            kind: GuestKind::Qemu,
            vmid: 100,
        }
    }

    #[test]
    fn test_authorization_header_prefix() {
        assert_eq!(
            authorization_header("root@pam!ops=abc"),
            "PVEAPIToken=root@pam!ops=abc"
        );
        assert_eq!(
            authorization_header("PVEAPIToken=root@pam!ops=abc"),
            "PVEAPIToken=root@pam!ops=abc"
        );
    }

    #[test]
    fn test_guest_url_encodes_node() {
        let client = ProxmoxClient::with_client(
            Url::parse("https://10.0.0.2:8006/api2/json").unwrap(),
            "t",
            Client::new(),
        );
        let url = client.guest_url(&guest(), &["status", "current"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://10.0.0.2:8006/api2/json/nodes/pve%201/qemu/100/status/current"
        );
    }

    #[tokio::test]
    async fn test_guest_status_parsed() {
        let (base, request) =
            serve_once("200 OK", r#"{"data":{"status":"running","vmid":100}}"#).await;
        let client = ProxmoxClient::with_client(base, "root@pam!ops=abc", Client::new());

        let status = client.guest_status(&guest()).await.unwrap();
        assert_eq!(status, "running");

        let request = request.await.unwrap();
        assert!(request.starts_with("GET /api2/json/nodes/pve%201/qemu/100/status/current"));
        assert!(request.to_lowercase().contains("authorization: pveapitoken=root@pam!ops=abc"));
    }

    #[tokio::test]
    async fn test_unauthorized_is_api_error() {
        let (base, _request) = serve_once("401 Unauthorized", r#"{"data":null}"#).await;
        let client = ProxmoxClient::with_client(base, "bad", Client::new());

        let err = client.version().await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_start_posts_to_status_start() {
        let (base, request) = serve_once("200 OK", r#"{"data":"UPID:pve:0001"}"#).await;
        let client = ProxmoxClient::with_client(base, "t", Client::new());

        let upid = client.start(&guest()).await.unwrap();
        assert_eq!(upid, Value::String("UPID:pve:0001".to_string()));
        assert!(request.await.unwrap().starts_with("POST /api2/json/nodes/pve%201/qemu/100/status/start"));
    }
}
