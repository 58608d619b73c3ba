use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct GrantConfig {
    pub secret: String,
    pub upload_ttl_seconds: i64,
    pub download_ttl_seconds: i64,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            secret: "dev-blob-secret".into(),
            upload_ttl_seconds: 300,
            download_ttl_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantPurpose {
    Upload,
    Download,
}

impl GrantPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantPurpose::Upload => "upload",
            GrantPurpose::Download => "download",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MintedGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("grant token rejected: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("grant does not cover the requested path")]
    PathMismatch,
    #[error("grant purpose does not allow this operation")]
    PurposeMismatch,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobClaims {
    sub: String,
    exp: i64,
    iat: i64,
    path: String,
    purpose: String,
}

pub fn mint_upload_grant(
    cfg: &GrantConfig,
    user_id: UserId,
    path: &str,
) -> Result<MintedGrant, jsonwebtoken::errors::Error> {
    mint_grant(cfg, user_id, path, GrantPurpose::Upload, cfg.upload_ttl_seconds)
}

pub fn mint_download_grant(
    cfg: &GrantConfig,
    user_id: UserId,
    path: &str,
) -> Result<MintedGrant, jsonwebtoken::errors::Error> {
    mint_grant(
        cfg,
        user_id,
        path,
        GrantPurpose::Download,
        cfg.download_ttl_seconds,
    )
}

fn mint_grant(
    cfg: &GrantConfig,
    user_id: UserId,
    path: &str,
    purpose: GrantPurpose,
    ttl_seconds: i64,
) -> Result<MintedGrant, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let expires_at = now + Duration::seconds(ttl_seconds);
    let claims = BlobClaims {
        sub: format!("user:{}", user_id.0),
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
        path: path.to_string(),
        purpose: purpose.as_str().to_string(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )?;
    Ok(MintedGrant { token, expires_at })
}

/// Checks signature, expiry, and that the token was minted for exactly
/// this path and operation.
pub fn verify_grant(
    cfg: &GrantConfig,
    token: &str,
    path: &str,
    purpose: GrantPurpose,
) -> Result<(), GrantError> {
    let mut validation = Validation::default();
    validation.leeway = 5;
    let decoded = decode::<BlobClaims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &validation,
    )?;
    if decoded.claims.path != path {
        return Err(GrantError::PathMismatch);
    }
    if decoded.claims.purpose != purpose.as_str() {
        return Err(GrantError::PurposeMismatch);
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
