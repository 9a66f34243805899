//! Blocking client for a `keylock serve` lock server.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::StoreError;
use crate::infrastructure::{LockStore, LockStoreAdmin, lease_millis};
use crate::types::{AcquireOutcome, LockEntry, LockToken, RefreshOutcome, ReleaseOutcome};

pub struct HttpLockStore {
    base_url: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpLockStore {
    /// `base_url` like `http://127.0.0.1:3100`
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(5))
            .build();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            agent,
        }
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn send(&self, method: &str, path: &str, body: Option<Value>) -> Result<(u16, Envelope), StoreError> {
        let mut request = self.agent.request(method, &format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {}", key));
        }

        let result = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(401, _)) => {
                return Err(StoreError::Unavailable("unauthorized".to_string()));
            }
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => {
                return Err(StoreError::Unavailable(transport.to_string()));
            }
        };

        let status = response.status();
        let envelope: Envelope = response
            .into_json()
            .map_err(|e| StoreError::Protocol(format!("{} {}: {}", method, path, e)))?;
        Ok((status, envelope))
    }

    fn unexpected(path: &str, status: u16, envelope: &Envelope) -> StoreError {
        let reason = envelope.error.as_deref().unwrap_or("no error message");
        if status == 503 {
            StoreError::Unavailable(format!("{}: {}", path, reason))
        } else {
            StoreError::Protocol(format!("{} returned {}: {}", path, status, reason))
        }
    }

    fn data<T: for<'de> Deserialize<'de>>(path: &str, envelope: Envelope) -> Result<T, StoreError> {
        let data = envelope
            .data
            .ok_or_else(|| StoreError::Protocol(format!("{}: missing data", path)))?;
        serde_json::from_value(data).map_err(|e| StoreError::Protocol(format!("{}: {}", path, e)))
    }
}

#[derive(Deserialize)]
struct Acquired {
    token: LockToken,
}

#[derive(Deserialize)]
struct Evicted {
    evicted: usize,
}

impl LockStore for HttpLockStore {
    fn acquire(&self, key: &str, lease: Duration) -> Result<AcquireOutcome, StoreError> {
        let lease_ms = lease_millis(lease)?;
        let (status, envelope) = self.send(
            "POST",
            "/locks",
            Some(json!({ "key": key, "lease_ms": lease_ms })),
        )?;
        match status {
            201 if envelope.success => {
                let acquired: Acquired = Self::data("/locks", envelope)?;
                Ok(AcquireOutcome::Acquired(acquired.token))
            }
            409 => Ok(AcquireOutcome::Busy),
            _ => Err(Self::unexpected("/locks", status, &envelope)),
        }
    }

    fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, StoreError> {
        let (status, envelope) = self.send(
            "POST",
            "/locks/release",
            Some(json!({ "key": key, "token": token })),
        )?;
        match status {
            200 if envelope.success => Ok(ReleaseOutcome::Released),
            409 => Ok(ReleaseOutcome::NotOwner),
            _ => Err(Self::unexpected("/locks/release", status, &envelope)),
        }
    }

    fn refresh(
        &self,
        key: &str,
        token: &LockToken,
        lease: Duration,
    ) -> Result<RefreshOutcome, StoreError> {
        let lease_ms = lease_millis(lease)?;
        let (status, envelope) = self.send(
            "POST",
            "/locks/refresh",
            Some(json!({ "key": key, "token": token, "lease_ms": lease_ms })),
        )?;
        match status {
            200 if envelope.success => Ok(RefreshOutcome::Refreshed),
            409 => Ok(RefreshOutcome::NotOwner),
            _ => Err(Self::unexpected("/locks/refresh", status, &envelope)),
        }
    }
}

impl LockStoreAdmin for HttpLockStore {
    fn active_entries(&self) -> Result<Vec<LockEntry>, StoreError> {
        let (status, envelope) = self.send("GET", "/locks", None)?;
        if status != 200 || !envelope.success {
            return Err(Self::unexpected("/locks", status, &envelope));
        }
        Self::data("/locks", envelope)
    }

    fn evict_expired(&self) -> Result<usize, StoreError> {
        let (status, envelope) = self.send("POST", "/evict", None)?;
        if status != 200 || !envelope.success {
            return Err(Self::unexpected("/evict", status, &envelope));
        }
        let evicted: Evicted = Self::data("/evict", envelope)?;
        Ok(evicted.evicted)
    }
}
