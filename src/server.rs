use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use futures::TryStreamExt;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ServerConfig, StorageConfig};
use crate::indexing::{SymbolIndexingResult, SymbolIndexingService};
use crate::metrics::MetricsCollector;
use crate::registry::JsonFileRegistry;
use crate::storage::{AzureBlobStorage, LocalStorage, StorageEngine, StorageError};

pub const API_KEY_HEADER: &str = "X-NuGet-ApiKey";

pub struct AppState {
    pub indexer: SymbolIndexingService,
    pub storage: Arc<dyn StorageEngine>,
    pub metrics: Arc<MetricsCollector>,
    pub api_key: Option<String>,
    pub max_upload_size: u64,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub async fn from_config(
        config: &ServerConfig,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let storage = build_storage(&config.storage)?;
        let registry = JsonFileRegistry::load(&config.registry_path).await?;
        info!("Loaded {} package registrations", registry.len());

        let metrics = Arc::new(MetricsCollector::new());
        let indexer = SymbolIndexingService::new(
            Arc::new(registry),
            Arc::clone(&storage),
            Arc::clone(&metrics),
        )
        .with_max_upload_size(config.max_upload_size);

        Ok(Self {
            indexer,
            storage,
            metrics,
            api_key: config.api_key.clone(),
            max_upload_size: config.max_upload_size,
            shutdown,
        })
    }

    fn authenticate(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.api_key.as_deref().filter(|k| !k.is_empty()) else {
            return true;
        };
        headers
            .get(API_KEY_HEADER)
            .map(|provided| bool::from(provided.as_bytes().ct_eq(expected.as_bytes())))
            .unwrap_or(false)
    }
}

pub fn build_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageEngine>> {
    Ok(match config {
        StorageConfig::Filesystem { path } => Arc::new(LocalStorage::new(path.clone())),
        StorageConfig::AzureBlob {
            account_url,
            container,
            sas_token,
        } => Arc::new(AzureBlobStorage::new(account_url, container, sas_token.clone())?),
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = usize::try_from(state.max_upload_size).unwrap_or(usize::MAX);
    Router::new()
        .route("/api/v2/symbol", put(upload))
        .route("/api/download/symbols/{file}/{key}/{file2}", get(download))
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

pub async fn run_on(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Server stopped");
    Ok(())
}

fn status_for(result: SymbolIndexingResult) -> StatusCode {
    match result {
        SymbolIndexingResult::Success => StatusCode::CREATED,
        SymbolIndexingResult::InvalidSymbolPackage => StatusCode::BAD_REQUEST,
        SymbolIndexingResult::PackageNotFound => StatusCode::NOT_FOUND,
        SymbolIndexingResult::Cancelled | SymbolIndexingResult::InternalError => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// `nuget push` sends the package as the first part of a multipart form;
// other clients send the raw archive as the body.
async fn upload(State(state): State<Arc<AppState>>, request: Request) -> StatusCode {
    if !state.authenticate(request.headers()) {
        warn!("Rejected symbol upload with missing or invalid API key");
        return StatusCode::UNAUTHORIZED;
    }

    let cancel = state.shutdown.child_token();
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    let result = if is_multipart {
        let mut multipart = match Multipart::from_request(request, &state).await {
            Ok(m) => m,
            Err(e) => {
                warn!("Malformed multipart upload: {}", e);
                return StatusCode::BAD_REQUEST;
            }
        };
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            _ => return StatusCode::BAD_REQUEST,
        };
        let mut reader = StreamReader::new(Box::pin(field.map_err(std::io::Error::other)));
        state.indexer.index(&mut reader, &cancel).await
    } else {
        let body = request.into_body().into_data_stream();
        let mut reader = StreamReader::new(Box::pin(body.map_err(std::io::Error::other)));
        state.indexer.index(&mut reader, &cancel).await
    };

    status_for(result)
}

/// SSQP signatures are hex; store them as lowercase GUID plus uppercase age.
fn canonical_signature(key: &str) -> String {
    if key.len() == 40 && key.bytes().all(|b| b.is_ascii_hexdigit()) {
        format!("{}{}", key[..32].to_ascii_lowercase(), key[32..].to_ascii_uppercase())
    } else {
        key.to_string()
    }
}

async fn download(
    State(state): State<Arc<AppState>>,
    Path((file, key, file2)): Path<(String, String, String)>,
) -> Response {
    let storage_key = format!(
        "{}/{}/{}",
        file.to_lowercase(),
        canonical_signature(&key),
        file2.to_lowercase()
    );

    match state.storage.load(&storage_key).await {
        Ok(stream) => {
            state.metrics.record_download();
            let metrics = Arc::clone(&state.metrics);
            let body = ReaderStream::new(stream)
                .inspect_ok(move |chunk| metrics.record_bytes_served(chunk.len() as u64));
            (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                Body::from_stream(body),
            )
                .into_response()
        }
        Err(StorageError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(StorageError::InvalidKey(_)) => StatusCode::BAD_REQUEST.into_response(),
        Err(e) => {
            error!("Failed to load symbols {}: {:?}", storage_key, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<crate::metrics::Metrics> {
    Json(state.metrics.get_metrics())
}
