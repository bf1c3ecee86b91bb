use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

/// Outcome of redeeming a viewer session token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Validation {
    pub ok: bool,
    pub subject_id: Option<String>,
}

impl Validation {
    pub fn granted(subject_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            subject_id: Some(subject_id.into()),
        }
    }

    pub fn denied() -> Self {
        Self::default()
    }
}

/// Redeems single-use viewer tokens against the auth service.
///
/// Implementations never fail: any problem talking to the auth service is a
/// denial.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str, tenant_code: &str) -> Validation;
}

/// Checks tenant ingest keys presented as `Authorization: Bearer`.
#[async_trait]
pub trait IngestVerifier: Send + Sync {
    async fn verify_ingest_key(&self, key: &str, tenant_code: &str) -> bool;
}

#[derive(Debug, Error)]
enum AuthError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    ok: bool,
    #[serde(default)]
    user_id: Option<serde_json::Value>,
    #[serde(default)]
    seller_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IngestVerifyResponse {
    ok: bool,
}

#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    base_url: String,
}

impl AuthClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn redeem(&self, token: &str, tenant_code: &str) -> Result<ValidateResponse, AuthError> {
        let response = self
            .http
            .get(format!("{}/auth/validate", self.base_url))
            .query(&[("sid", token), ("seller", tenant_code)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Status(response.status()));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl TokenValidator for AuthClient {
    async fn validate(&self, token: &str, tenant_code: &str) -> Validation {
        if token.trim().is_empty() || tenant_code.trim().is_empty() {
            return Validation::denied();
        }

        match self.redeem(token, tenant_code).await {
            Ok(body) if body.ok => {
                if let Some(code) = body.seller_code.as_deref() {
                    if code != tenant_code {
                        warn!(tenant = tenant_code, granted_for = code, "token granted for another tenant");
                        return Validation::denied();
                    }
                }
                let subject_id = body.user_id.map(|id| match id {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                });
                Validation { ok: true, subject_id }
            }
            Ok(_) => {
                debug!(tenant = tenant_code, "token rejected by auth service");
                Validation::denied()
            }
            Err(err) => {
                warn!(tenant = tenant_code, error = %err, "token validation call failed");
                Validation::denied()
            }
        }
    }
}

#[async_trait]
impl IngestVerifier for AuthClient {
    async fn verify_ingest_key(&self, key: &str, tenant_code: &str) -> bool {
        let result: Result<IngestVerifyResponse, AuthError> = async {
            let response = self
                .http
                .post(format!("{}/ingest/verify", self.base_url))
                .bearer_auth(key)
                .json(&json!({ "seller_code": tenant_code }))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(AuthError::Status(response.status()));
            }
            Ok(response.json().await?)
        }
        .await;

        match result {
            Ok(body) => body.ok,
            Err(err) => {
                warn!(tenant = tenant_code, error = %err, "ingest key verification failed");
                false
            }
        }
    }
}
