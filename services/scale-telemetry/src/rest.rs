//! Device and authentication REST client
//!
//! The REST endpoints are collaborators of the live telemetry path: they
//! supply the device list (which ids to watch) and historical metrics.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};
use crate::wire::{DeviceStatus, TelemetrySnapshot};

/// Link state between the backend and a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
    Connecting,
}

/// Device registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub status: DeviceStatus,
    pub last_update: DateTime<Utc>,
    pub connection_status: ConnectionStatus,
    /// Efficiency/performance indicator, 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_percentage: Option<u8>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub name: String,
}

/// Successful login response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: String,
    pub user: User,
}

/// Abstraction over the device REST API for dependency injection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// All registered devices, sorted by id
    async fn list_devices(&self) -> Result<Vec<Device>>;

    async fn get_device(&self, id: &str) -> Result<Device>;

    /// Historical snapshots for one device; the server default applies when
    /// `limit` is `None`
    async fn device_metrics(&self, id: &str, limit: Option<u32>) -> Result<Vec<TelemetrySnapshot>>;

    /// Log in and remember the session token for later requests
    async fn login(&self, credentials: &Credentials) -> Result<AuthSession>;

    /// Log out and forget the session token
    async fn logout(&self) -> Result<()>;
}

/// Production client using reqwest
pub struct HttpDeviceApi {
    client: reqwest::Client,
    base_url: String,
    token: Mutex<Option<String>>,
}

impl HttpDeviceApi {
    /// `base_url` is the API root, e.g. `http://localhost:8080/api`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        }
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.lock().as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        tracing::debug!("GET {}", url);
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(|e| TelemetryError::Http(format!("GET {} failed: {}", url, e)))?;
        let body = read_success("GET", url, response).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

async fn read_success(method: &str, url: &str, response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| TelemetryError::Http(format!("Reading response body: {}", e)))?;

    tracing::debug!("{} {} -> {} ({} bytes)", method, url, status.as_u16(), body.len());
    if !status.is_success() {
        return Err(TelemetryError::Http(format!(
            "{} {} returned {}: {}",
            method,
            url,
            status.as_u16(),
            body
        )));
    }
    Ok(body)
}

#[async_trait]
impl DeviceApi for HttpDeviceApi {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        self.get_json(&self.url("/devices")).await
    }

    async fn get_device(&self, id: &str) -> Result<Device> {
        self.get_json(&self.url(&format!("/devices/{}", id))).await
    }

    async fn device_metrics(&self, id: &str, limit: Option<u32>) -> Result<Vec<TelemetrySnapshot>> {
        let url = match limit {
            Some(limit) => self.url(&format!("/devices/{}/metrics?limit={}", id, limit)),
            None => self.url(&format!("/devices/{}/metrics", id)),
        };
        self.get_json(&url).await
    }

    async fn login(&self, credentials: &Credentials) -> Result<AuthSession> {
        let url = self.url("/auth/login");
        tracing::debug!("POST {} as '{}'", url, credentials.username);
        let response = self
            .client
            .post(&url)
            .json(credentials)
            .send()
            .await
            .map_err(|e| TelemetryError::Http(format!("POST {} failed: {}", url, e)))?;
        let body = read_success("POST", &url, response).await?;
        let session: AuthSession = serde_json::from_str(&body)?;

        *self.token.lock() = Some(session.token.clone());
        tracing::info!("Logged in as '{}'", session.user.username);
        Ok(session)
    }

    async fn logout(&self) -> Result<()> {
        if self.token.lock().is_none() {
            return Ok(());
        }

        let url = self.url("/auth/logout");
        tracing::debug!("POST {}", url);
        let response = self
            .authorized(self.client.post(&url))
            .send()
            .await
            .map_err(|e| TelemetryError::Http(format!("POST {} failed: {}", url, e)))?;
        let result = read_success("POST", &url, response).await.map(|_| ());

        *self.token.lock() = None;
        result
    }
}
