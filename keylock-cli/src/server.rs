use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;

use keylock_core::clock::now_ms;
use keylock_core::error::StoreError;
use keylock_core::infrastructure::{LockStore, LockStoreAdmin};
use keylock_core::infrastructure_in_memory::InMemoryLockStore;
use keylock_core::types::{AcquireOutcome, LockEntry, RefreshOutcome, ReleaseOutcome};

use crate::handlers::*;

pub type AppState = Arc<dyn LockStoreAdmin>;

pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    pub storage: String,
    pub max_concurrency: usize,
}

pub async fn run(options: ServeOptions) -> std::io::Result<()> {
    let state = create_store(&options.storage).map_err(std::io::Error::other)?;
    let app = router(state, options.max_concurrency);

    let addr = format!("{}:{}", options.host, options.port);

    if std::env::var("KEYLOCK_API_KEY").is_ok() {
        tracing::info!("🔐 API key authentication enabled");
    } else {
        tracing::warn!("⚠️  No KEYLOCK_API_KEY set, lock server is open (dev mode)");
    }

    tracing::info!("🔒 keylock server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await
}

pub fn router(state: AppState, max_concurrency: usize) -> Router {
    Router::new()
        // Health is always open (no auth)
        .route("/health", get(health))
        .route("/locks", post(acquire_lock))
        .route("/locks", get(list_locks))
        .route("/locks/release", post(release_lock))
        .route("/locks/refresh", post(refresh_lock))
        .route("/evict", post(evict_expired))
        .layer(middleware::from_fn(auth_middleware))
        .layer(ConcurrencyLimitLayer::new(max_concurrency.max(1)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Auth Middleware ────────────────────────────────────────────────────────

async fn auth_middleware(
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // If no API key is configured, allow all requests (dev mode)
    let expected_key = match std::env::var("KEYLOCK_API_KEY") {
        Ok(key) if !key.is_empty() => key,
        _ => return Ok(next.run(request).await),
    };

    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth_header.strip_prefix("Bearer ").unwrap_or("");

    if token == expected_key {
        Ok(next.run(request).await)
    } else {
        tracing::warn!("🚫 Unauthorized request to {}", request.uri().path());
        Err(StatusCode::UNAUTHORIZED)
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────────

/// Run a store call on the blocking pool. Stores may block for up to their
/// busy timeout.
async fn blocking<T, F>(state: &AppState, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn LockStoreAdmin) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(state);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .unwrap_or_else(|e| Err(StoreError::Unavailable(format!("store task failed: {}", e))))
}

fn store_failure<T: serde::Serialize>(
    action: &str,
    error: impl std::fmt::Display,
) -> (StatusCode, Json<ApiResponse<T>>) {
    tracing::error!(action, error = %error, "Lock store failure");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ApiResponse::err(format!("{} failed: {}", action, error))),
    )
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    match blocking(&state, |store| store.active_entries()).await {
        Ok(entries) => (
            StatusCode::OK,
            Json(ApiResponse::ok(HealthResponse {
                status: "ok".to_string(),
                active_locks: entries.len(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            })),
        ),
        Err(e) => store_failure("health", e),
    }
}

async fn acquire_lock(
    State(state): State<AppState>,
    Json(req): Json<AcquireLockRequest>,
) -> (StatusCode, Json<ApiResponse<AcquiredResponse>>) {
    let lease = match req.validate() {
        Ok(lease) => lease,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(ApiResponse::err(e))),
    };

    let key = req.key.clone();
    let lease_ms = req.lease_ms;
    let outcome = blocking(&state, move |store| match store.acquire(&key, lease)? {
        AcquireOutcome::Acquired(token) => {
            // The entry can already be gone under a very short lease
            let expires_at = store
                .lookup(&key)?
                .filter(|entry| entry.token == token)
                .map_or_else(|| now_ms().saturating_add(lease_ms), |entry| entry.expires_at);
            Ok(Some((token, expires_at)))
        }
        AcquireOutcome::Busy => Ok(None),
    })
    .await;

    match outcome {
        Ok(Some((token, expires_at))) => {
            tracing::info!(key = %req.key, lease_ms = req.lease_ms, "Lock acquired");
            (
                StatusCode::CREATED,
                Json(ApiResponse::ok(AcquiredResponse {
                    key: req.key,
                    token,
                    expires_at,
                })),
            )
        }
        Ok(None) => {
            tracing::info!(key = %req.key, "Lock busy");
            (
                StatusCode::CONFLICT,
                Json(ApiResponse::err(format!("Lock '{}' is held", req.key))),
            )
        }
        Err(e) => store_failure("acquire", e),
    }
}

async fn release_lock(
    State(state): State<AppState>,
    Json(req): Json<ReleaseLockRequest>,
) -> (StatusCode, Json<ApiResponse<ReleasedResponse>>) {
    if let Err(e) = req.validate() {
        return (StatusCode::BAD_REQUEST, Json(ApiResponse::err(e)));
    }

    let (key, token) = (req.key.clone(), req.token.clone());
    match blocking(&state, move |store| store.release(&key, &token)).await {
        Ok(ReleaseOutcome::Released) => {
            tracing::info!(key = %req.key, "Lock released");
            (
                StatusCode::OK,
                Json(ApiResponse::ok(ReleasedResponse { key: req.key })),
            )
        }
        Ok(ReleaseOutcome::NotOwner) => {
            tracing::warn!(key = %req.key, "Release refused: token does not own the lock");
            (
                StatusCode::CONFLICT,
                Json(ApiResponse::err(format!("Lock '{}' is not held by this token", req.key))),
            )
        }
        Err(e) => store_failure("release", e),
    }
}

async fn refresh_lock(
    State(state): State<AppState>,
    Json(req): Json<RefreshLockRequest>,
) -> (StatusCode, Json<ApiResponse<RefreshedResponse>>) {
    let lease = match req.validate() {
        Ok(lease) => lease,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(ApiResponse::err(e))),
    };

    let (key, token) = (req.key.clone(), req.token.clone());
    match blocking(&state, move |store| store.refresh(&key, &token, lease)).await {
        Ok(RefreshOutcome::Refreshed) => {
            tracing::info!(key = %req.key, lease_ms = req.lease_ms, "Lock lease refreshed");
            (
                StatusCode::OK,
                Json(ApiResponse::ok(RefreshedResponse {
                    key: req.key,
                    lease_ms: req.lease_ms,
                })),
            )
        }
        Ok(RefreshOutcome::NotOwner) => (
            StatusCode::CONFLICT,
            Json(ApiResponse::err(format!("Lock '{}' is not held by this token", req.key))),
        ),
        Err(e) => store_failure("refresh", e),
    }
}

async fn list_locks(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<Vec<LockEntry>>>) {
    match blocking(&state, |store| store.active_entries()).await {
        Ok(entries) => (StatusCode::OK, Json(ApiResponse::ok(entries))),
        Err(e) => store_failure("list", e),
    }
}

async fn evict_expired(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<EvictResponse>>) {
    match blocking(&state, |store| store.evict_expired()).await {
        Ok(evicted) => {
            tracing::info!(evicted = evicted, "Expired locks evicted");
            (StatusCode::OK, Json(ApiResponse::ok(EvictResponse { evicted })))
        }
        Err(e) => store_failure("evict", e),
    }
}

// ─── Storage Backend Selection ──────────────────────────────────────────────

/// Open the backend named by `storage`: `memory` or `sqlite:<path>`.
/// A backend that cannot be opened is an error; there is no fallback store.
pub fn create_store(storage: &str) -> Result<AppState, String> {
    if storage == "memory" {
        tracing::info!("💾 Storage backend: in-memory (locks will not persist)");
        Ok(Arc::new(InMemoryLockStore::new()))
    } else if let Some(path) = storage.strip_prefix("sqlite:") {
        #[cfg(feature = "sqlite")]
        {
            let store = keylock_core::infrastructure_sqlite::SqliteLockStore::open(path)
                .map_err(|e| format!("Failed to open SQLite store '{}': {}", path, e))?;
            tracing::info!("💾 Storage backend: SQLite ({})", path);
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        {
            Err(format!(
                "SQLite storage '{}' requested but the `sqlite` feature is not enabled. \
                 Rebuild with: cargo build --features sqlite",
                path
            ))
        }
    } else {
        Err(format!(
            "Unknown storage backend: '{}'. Use 'memory' or 'sqlite:<path>'",
            storage
        ))
    }
}
