//! Authorization handshake
//!
//! Two-step nonce protocol: fetch a challenge nonce for a principal id,
//! sign its SHA-256 digest with the principal's RSA key (PKCS#1 v1.5),
//! and post the base64url signature back for an opaque bearer token.
//! A failure at either step ends the session; there is no retry.

use rsa::RsaPrivateKey;
use serde::Deserialize;
use skerry_core::crypto::{b64_encode, rsa_sign};
use skerry_core::error::{Error, Result};
use std::fmt;
use tracing::debug;

/// Which kind of principal is authenticating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Renter,
    Provider,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Renter => "renter",
            Role::Provider => "provider",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct AuthChallenge {
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for the metaserver's `/auth/<role>` endpoints.
pub struct AuthClient {
    base_url: String,
    http: reqwest::Client,
}

impl AuthClient {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Run the handshake and return the bearer token.
    pub async fn get_auth_token(
        &self,
        private_key: &RsaPrivateKey,
        role: Role,
        principal_id: &str,
    ) -> Result<String> {
        let challenge_url = format!(
            "{}/auth/{}?{}ID={}",
            self.base_url, role, role, principal_id
        );
        let resp = self
            .http
            .get(&challenge_url)
            .send()
            .await
            .map_err(http_err)?;
        if !resp.status().is_success() {
            return Err(Error::Auth(error_text(resp).await));
        }
        let challenge: AuthChallenge = resp
            .json()
            .await
            .map_err(|e| Error::Auth(format!("malformed challenge: {e}")))?;

        // The server verifies PKCS#1 v1.5 over SHA-256 of the nonce text.
        let signature = rsa_sign(private_key, challenge.nonce.as_bytes());
        let signed = b64_encode(&signature);

        debug!(%role, principal = principal_id, "submitting signed nonce");
        let respond_url = format!("{}/auth/{}", self.base_url, role);
        let resp = self
            .http
            .post(&respond_url)
            .form(&[
                (format!("{role}ID"), principal_id.to_string()),
                ("signedNonce".to_string(), signed),
            ])
            .send()
            .await
            .map_err(http_err)?;
        if !resp.status().is_success() {
            return Err(Error::Auth(error_text(resp).await));
        }
        let token = resp
            .text()
            .await
            .map_err(|e| Error::Auth(format!("unreadable token reply: {e}")))?;
        Ok(token.trim().to_string())
    }
}

fn http_err(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else {
        Error::Network(err.to_string())
    }
}

async fn error_text(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    }
}
