//! Metaserver directory client
//!
//! Wraps the metaserver's JSON routes in typed calls. Mutating calls and
//! reads under `/renters/<id>/...` require a bearer token obtained with
//! [`Client::authorize_renter`]; directory registration and provider
//! listings are open. Error payloads carry `{"error": "<text>"}`.

use crate::auth::{AuthClient, Role};
use reqwest::{Method, StatusCode};
use rsa::RsaPrivateKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skerry_core::error::{Error, Result};
use skerry_core::types::{Contract, File, Permission, ProviderInfo, RenterInfo, Version};
use std::sync::RwLock;
use std::time::Duration;
use tracing::instrument;

/// Deadline for directory calls.
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Metaserver client
pub struct Client {
    base_url: String,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl Client {
    /// Create a client for the metaserver at `base_url`
    /// (e.g. `http://localhost:8001`).
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|e| Error::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            token: RwLock::new(None),
        })
    }

    /// Run the authorization handshake as a renter and keep the token
    /// for subsequent calls.
    #[instrument(skip(self, private_key))]
    pub async fn authorize_renter(
        &self,
        private_key: &RsaPrivateKey,
        renter_id: &str,
    ) -> Result<()> {
        let auth = AuthClient::new(&self.base_url, self.http.clone());
        let token = auth
            .get_auth_token(private_key, Role::Renter, renter_id)
            .await?;
        *self.token.write().unwrap() = Some(token);
        Ok(())
    }

    /// The current bearer token, if authorized.
    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap().clone()
    }

    // ==================== Renters ====================

    /// Register a new renter. The metaserver assigns the id from the
    /// public key fingerprint and echoes the stored record.
    pub async fn register_renter(&self, info: &RenterInfo) -> Result<RenterInfo> {
        self.post_returning("/renters".to_string(), info, false).await
    }

    pub async fn get_renter(&self, renter_id: &str) -> Result<RenterInfo> {
        self.get_json(format!("/renters/{renter_id}"), true).await
    }

    pub async fn update_renter(&self, info: &RenterInfo) -> Result<()> {
        self.send_json(Method::PUT, format!("/renters/{}", info.id), Some(info), true)
            .await
    }

    pub async fn delete_renter(&self, renter_id: &str) -> Result<()> {
        self.send_json::<()>(Method::DELETE, format!("/renters/{renter_id}"), None, true)
            .await
    }

    // ==================== Providers ====================

    pub async fn register_provider(&self, info: &ProviderInfo) -> Result<ProviderInfo> {
        self.post_returning("/providers".to_string(), info, false)
            .await
    }

    pub async fn get_providers(&self) -> Result<Vec<ProviderInfo>> {
        self.get_json("/providers".to_string(), false).await
    }

    pub async fn get_provider(&self, provider_id: &str) -> Result<ProviderInfo> {
        self.get_json(format!("/providers/{provider_id}"), false)
            .await
    }

    pub async fn update_provider(&self, info: &ProviderInfo) -> Result<()> {
        self.send_json(
            Method::PUT,
            format!("/providers/{}", info.id),
            Some(info),
            true,
        )
        .await
    }

    pub async fn delete_provider(&self, provider_id: &str) -> Result<()> {
        self.send_json::<()>(Method::DELETE, format!("/providers/{provider_id}"), None, true)
            .await
    }

    // ==================== Files ====================

    pub async fn post_file(&self, renter_id: &str, file: &File) -> Result<()> {
        self.send_json(
            Method::POST,
            format!("/renters/{renter_id}/files"),
            Some(file),
            true,
        )
        .await
    }

    pub async fn get_files(&self, renter_id: &str) -> Result<Vec<File>> {
        self.get_json(format!("/renters/{renter_id}/files"), true)
            .await
    }

    pub async fn get_file(&self, renter_id: &str, file_id: &str) -> Result<File> {
        self.get_json(format!("/renters/{renter_id}/files/{file_id}"), true)
            .await
    }

    pub async fn update_file(&self, renter_id: &str, file: &File) -> Result<()> {
        self.send_json(
            Method::PUT,
            format!("/renters/{renter_id}/files/{}", file.id),
            Some(file),
            true,
        )
        .await
    }

    pub async fn delete_file(&self, renter_id: &str, file_id: &str) -> Result<()> {
        self.send_json::<()>(
            Method::DELETE,
            format!("/renters/{renter_id}/files/{file_id}"),
            None,
            true,
        )
        .await
    }

    // ==================== Versions ====================

    pub async fn post_version(
        &self,
        renter_id: &str,
        file_id: &str,
        version: &Version,
    ) -> Result<()> {
        self.send_json(
            Method::POST,
            format!("/renters/{renter_id}/files/{file_id}/versions"),
            Some(version),
            true,
        )
        .await
    }

    pub async fn get_versions(&self, renter_id: &str, file_id: &str) -> Result<Vec<Version>> {
        self.get_json(
            format!("/renters/{renter_id}/files/{file_id}/versions"),
            true,
        )
        .await
    }

    pub async fn get_version(
        &self,
        renter_id: &str,
        file_id: &str,
        num: u32,
    ) -> Result<Version> {
        self.get_json(
            format!("/renters/{renter_id}/files/{file_id}/versions/{num}"),
            true,
        )
        .await
    }

    pub async fn put_version(
        &self,
        renter_id: &str,
        file_id: &str,
        version: &Version,
    ) -> Result<()> {
        self.send_json(
            Method::PUT,
            format!(
                "/renters/{renter_id}/files/{file_id}/versions/{}",
                version.num
            ),
            Some(version),
            true,
        )
        .await
    }

    pub async fn delete_version(&self, renter_id: &str, file_id: &str, num: u32) -> Result<()> {
        self.send_json::<()>(
            Method::DELETE,
            format!("/renters/{renter_id}/files/{file_id}/versions/{num}"),
            None,
            true,
        )
        .await
    }

    // ==================== Permissions and shared views ====================

    pub async fn post_permission(
        &self,
        renter_id: &str,
        file_id: &str,
        permission: &Permission,
    ) -> Result<()> {
        self.send_json(
            Method::POST,
            format!("/renters/{renter_id}/files/{file_id}/permissions"),
            Some(permission),
            true,
        )
        .await
    }

    pub async fn delete_permission(
        &self,
        renter_id: &str,
        file_id: &str,
        user_id: &str,
    ) -> Result<()> {
        self.send_json::<()>(
            Method::DELETE,
            format!("/renters/{renter_id}/files/{file_id}/permissions/{user_id}"),
            None,
            true,
        )
        .await
    }

    pub async fn get_shared_files(&self, renter_id: &str) -> Result<Vec<File>> {
        self.get_json(format!("/renters/{renter_id}/shared"), true)
            .await
    }

    pub async fn get_shared_file(&self, renter_id: &str, file_id: &str) -> Result<File> {
        self.get_json(format!("/renters/{renter_id}/shared/{file_id}"), true)
            .await
    }

    pub async fn remove_shared_file(&self, renter_id: &str, file_id: &str) -> Result<()> {
        self.send_json::<()>(
            Method::DELETE,
            format!("/renters/{renter_id}/shared/{file_id}"),
            None,
            true,
        )
        .await
    }

    // ==================== Contracts ====================

    pub async fn post_contract(&self, renter_id: &str, contract: &Contract) -> Result<()> {
        self.send_json(
            Method::POST,
            format!("/renters/{renter_id}/contracts"),
            Some(contract),
            true,
        )
        .await
    }

    pub async fn get_contracts(&self, renter_id: &str) -> Result<Vec<Contract>> {
        self.get_json(format!("/renters/{renter_id}/contracts"), true)
            .await
    }

    pub async fn get_contract(&self, renter_id: &str, contract_id: &str) -> Result<Contract> {
        self.get_json(format!("/renters/{renter_id}/contracts/{contract_id}"), true)
            .await
    }

    pub async fn delete_contract(&self, renter_id: &str, contract_id: &str) -> Result<()> {
        self.send_json::<()>(
            Method::DELETE,
            format!("/renters/{renter_id}/contracts/{contract_id}"),
            None,
            true,
        )
        .await
    }

    // ==================== Plumbing ====================

    fn bearer(&self) -> Result<String> {
        self.token
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Auth("must authorize before calling this method".to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: String, auth: bool) -> Result<T> {
        let mut req = self.http.get(self.url(&path));
        if auth {
            req = req.bearer_auth(self.bearer()?);
        }
        let resp = check_status(req.send().await.map_err(http_err)?).await?;
        resp.json()
            .await
            .map_err(|e| Error::Serialization(format!("malformed reply for {path}: {e}")))
    }

    async fn post_returning<T: Serialize, U: DeserializeOwned>(
        &self,
        path: String,
        body: &T,
        auth: bool,
    ) -> Result<U> {
        let mut req = self.http.post(self.url(&path)).json(body);
        if auth {
            req = req.bearer_auth(self.bearer()?);
        }
        let resp = check_status(req.send().await.map_err(http_err)?).await?;
        resp.json()
            .await
            .map_err(|e| Error::Serialization(format!("malformed reply for {path}: {e}")))
    }

    async fn send_json<T: Serialize>(
        &self,
        method: Method,
        path: String,
        body: Option<&T>,
        auth: bool,
    ) -> Result<()> {
        let mut req = self.http.request(method, self.url(&path));
        if let Some(body) = body {
            req = req.json(body);
        }
        if auth {
            req = req.bearer_auth(self.bearer()?);
        }
        check_status(req.send().await.map_err(http_err)?).await?;
        Ok(())
    }
}

fn http_err(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else {
        Error::Network(err.to_string())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = match resp.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth(message),
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::REQUEST_TIMEOUT => Error::Timeout(message),
        _ => Error::Network(format!("{status}: {message}")),
    })
}
