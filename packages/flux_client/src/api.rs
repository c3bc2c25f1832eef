//! REST client for the gateway's `/api/v1` surface.

use flux_protocol::SshConfig;
use futures::future::BoxFuture;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GatewayConfig;
use crate::error::ApiError;

/// A serial port as reported by `GET /ports`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_usb: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PortList {
    #[serde(default)]
    ports: Vec<PortInfo>,
}

#[derive(Debug, Deserialize)]
struct SshResponse {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Creates and tears down remote SSH sessions on behalf of a session actor.
pub trait SshGateway: Send + Sync + 'static {
    /// Returns the remote session id to attach to.
    fn open(&self, config: SshConfig) -> BoxFuture<'static, Result<String, ApiError>>;
    fn close(&self, remote_id: String) -> BoxFuture<'static, Result<(), ApiError>>;
}

#[derive(Clone, Debug)]
pub struct GatewayApi {
    client: reqwest::Client,
    base: Url,
}

impl GatewayApi {
    pub fn new(config: &GatewayConfig) -> Result<Self, ApiError> {
        let base = Url::parse(&config.api_base)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", config.api_base, e)))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(config.api_base.clone()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(ApiError::from_reqwest)?;
        Ok(Self { client, base })
    }

    /// `base/<segments...>`, each segment percent-encoded (port names contain `/`).
    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn list_ports(&self) -> Result<Vec<PortInfo>, ApiError> {
        let url = self.url(&["ports"])?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        let list: PortList = read_json(resp).await?;
        Ok(list.ports)
    }

    pub async fn set_dtr(&self, port: &str, value: bool) -> Result<(), ApiError> {
        self.set_line(port, "dtr", value).await
    }

    pub async fn set_rts(&self, port: &str, value: bool) -> Result<(), ApiError> {
        self.set_line(port, "rts", value).await
    }

    async fn set_line(&self, port: &str, line: &str, value: bool) -> Result<(), ApiError> {
        let url = self.url(&["ports", port, line])?;
        debug!(port, line, value, "setting modem control line");
        let resp = self
            .client
            .post(url)
            .json(&serde_json::json!({ "value": value }))
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        read_json::<serde_json::Value>(resp).await?;
        Ok(())
    }

    pub async fn connect_ssh(&self, config: &SshConfig) -> Result<String, ApiError> {
        let url = self.url(&["ssh", "connect"])?;
        debug!(target = %config.target(), "creating ssh session");
        let resp = self
            .client
            .post(url)
            .json(config)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        let body: SshResponse = read_json(resp).await?;
        match (body.success, body.session_id) {
            (true, Some(id)) if !id.is_empty() => Ok(id),
            (true, _) => Err(ApiError::Rejected(
                "gateway did not return a session id".to_string(),
            )),
            (false, _) => Err(ApiError::Rejected(body.message)),
        }
    }

    pub async fn close_ssh(&self, remote_id: &str) -> Result<(), ApiError> {
        let url = self.url(&["ssh", remote_id])?;
        let resp = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        let body: SshResponse = read_json(resp).await?;
        if body.success {
            Ok(())
        } else {
            Err(ApiError::Rejected(body.message))
        }
    }
}

impl SshGateway for GatewayApi {
    fn open(&self, config: SshConfig) -> BoxFuture<'static, Result<String, ApiError>> {
        let api = self.clone();
        Box::pin(async move { api.connect_ssh(&config).await })
    }

    fn close(&self, remote_id: String) -> BoxFuture<'static, Result<(), ApiError>> {
        let api = self.clone();
        Box::pin(async move { api.close_ssh(&remote_id).await })
    }
}

/// Decode a JSON body, turning non-2xx responses into [`ApiError::Status`]
/// with the gateway's `{error}` message when it sent one.
async fn read_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or_else(|_| text.trim().to_string());
        return Err(ApiError::Status { status, message });
    }
    resp.json().await.map_err(ApiError::from_reqwest)
}
