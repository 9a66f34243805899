use keylock_core::infrastructure::lease_millis;
use keylock_core::types::{CallContext, LockConfig, LockToken};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ─── Request Types ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AcquireLockRequest {
    pub key: String,
    pub lease_ms: u64,
}

impl AcquireLockRequest {
    pub fn validate(&self) -> Result<Duration, String> {
        validate_key(&self.key)?;
        validate_lease(self.lease_ms)
    }
}

#[derive(Deserialize)]
pub struct ReleaseLockRequest {
    pub key: String,
    pub token: LockToken,
}

impl ReleaseLockRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_key(&self.key)?;
        validate_token(&self.token)
    }
}

#[derive(Deserialize)]
pub struct RefreshLockRequest {
    pub key: String,
    pub token: LockToken,
    pub lease_ms: u64,
}

impl RefreshLockRequest {
    pub fn validate(&self) -> Result<Duration, String> {
        validate_key(&self.key)?;
        validate_token(&self.token)?;
        validate_lease(self.lease_ms)
    }
}

/// Input of `keylock derive`
#[derive(Deserialize)]
pub struct DeriveRequest {
    pub call: CallContext,
    #[serde(default)]
    pub config: LockConfig,
}

// ─── Validation Helpers ─────────────────────────────────────────────────────

fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("key is required".to_string());
    }
    Ok(())
}

fn validate_token(token: &LockToken) -> Result<(), String> {
    if token.as_str().is_empty() {
        return Err("token is required".to_string());
    }
    Ok(())
}

fn validate_lease(lease_ms: u64) -> Result<Duration, String> {
    let lease = Duration::from_millis(lease_ms);
    lease_millis(lease)
        .map(|_| lease)
        .map_err(|_| "lease_ms must be greater than 0".to_string())
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Serialize)]
pub struct AcquiredResponse {
    pub key: String,
    pub token: LockToken,
    pub expires_at: u64,
}

#[derive(Serialize)]
pub struct ReleasedResponse {
    pub key: String,
}

#[derive(Serialize)]
pub struct RefreshedResponse {
    pub key: String,
    pub lease_ms: u64,
}

#[derive(Serialize)]
pub struct EvictResponse {
    pub evicted: usize,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_locks: usize,
    pub version: String,
}
