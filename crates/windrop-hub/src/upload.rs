//! Block upload endpoint (mirror mode)
//!
//! `POST /upload` with `{ "blocks": [{ "cid": ..., "bytes": <base64> }] }`
//! stores each block in the content layer and pins its cid. The response
//! lists which cids were stored and which failed, per block. CORS is
//! wide open: browsers upload from arbitrary origins.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use windrop_core::{ContentClient, ContentId};

use crate::error::HubError;
use crate::pinning::Pinner;

#[derive(Debug, Deserialize)]
pub struct UploadBlock {
    pub cid: String,
    /// Base64-encoded block bytes.
    pub bytes: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub blocks: Vec<UploadBlock>,
}

#[derive(Debug, Serialize)]
pub struct FailedBlock {
    pub cid: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub stored: Vec<String>,
    pub failed: Vec<FailedBlock>,
}

#[derive(Clone)]
struct UploadState {
    content: Arc<dyn ContentClient>,
    pinner: Arc<Pinner>,
}

/// Build the upload router.
pub fn router(content: Arc<dyn ContentClient>, pinner: Arc<Pinner>) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .layer(CorsLayer::permissive())
        .with_state(UploadState { content, pinner })
}

/// Serve the upload endpoint until the process exits.
pub async fn serve(
    addr: SocketAddr,
    content: Arc<dyn ContentClient>,
    pinner: Arc<Pinner>,
) -> Result<(), HubError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| HubError::Startup(format!("http bind {addr}: {e}")))?;
    info!(addr = %addr, "upload endpoint listening");
    axum::serve(listener, router(content, pinner))
        .await
        .map_err(|e| HubError::Startup(format!("http serve: {e}")))
}

async fn upload(
    State(state): State<UploadState>,
    Json(request): Json<UploadRequest>,
) -> Json<UploadResponse> {
    let mut stored = Vec::new();
    let mut failed = Vec::new();

    for block in request.blocks {
        let cid = ContentId::new(block.cid.clone());
        let bytes = match BASE64.decode(&block.bytes) {
            Ok(bytes) => bytes,
            Err(e) => {
                failed.push(FailedBlock {
                    cid: block.cid,
                    error: format!("invalid base64: {e}"),
                });
                continue;
            }
        };
        if let Err(e) = state.content.put_block(&cid, bytes).await {
            warn!(cid = %cid, error = %e, "block store failed");
            failed.push(FailedBlock {
                cid: block.cid,
                error: e.to_string(),
            });
            continue;
        }
        debug!(cid = %cid, "block stored");
        state.pinner.pin_cids(vec![cid]);
        stored.push(block.cid);
    }

    Json(UploadResponse { stored, failed })
}
