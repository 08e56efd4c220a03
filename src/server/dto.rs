use serde::{Deserialize, Serialize};

use crate::types::Credentials;

#[derive(Debug, Default, Deserialize)]
pub struct IssueCredentialsRequest {
    /// Appended to the generated login name, e.g. a tool identifier.
    #[serde(default)]
    pub suffix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CredentialFailure {
    pub database: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct IssueCredentialsResponse {
    pub credentials: Vec<Credentials>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<CredentialFailure>,
}

#[derive(Debug, Serialize)]
pub struct TableResponse {
    pub database: String,
    pub schema: String,
    pub table: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub sql: String,
    pub filename: String,
    #[serde(default)]
    pub unfiltered_sql: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePrincipalRequest {
    pub external_id: String,
    pub email: String,
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreatePrincipalTokenRequest {
    #[serde(default)]
    pub expires_in_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub id: String,
    pub is_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreateTokenResponse {
    pub token: String,
    pub metadata: TokenResponse,
}
