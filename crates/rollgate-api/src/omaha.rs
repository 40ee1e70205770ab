//! Omaha update endpoint.

use std::net::SocketAddr;

use axum::Extension;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use rollgate_omaha::OmahaError;
use tracing::{error, warn};

use crate::ApiState;

/// POST /v1/update
pub async fn update(
    State(state): State<ApiState>,
    headers: HeaderMap,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    body: String,
) -> impl IntoResponse {
    let ip = client_ip(&headers, connect_info.map(|Extension(ConnectInfo(addr))| addr));

    match state.omaha.handle(&body, &ip) {
        Ok(xml) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/xml")], xml).into_response(),
        Err(e @ OmahaError::Decode(_)) => {
            warn!(%ip, error = %e, "rejecting omaha request");
            (StatusCode::BAD_REQUEST, "malformed omaha request").into_response()
        }
        Err(e) => {
            error!(%ip, error = %e, "omaha response failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Forwarding headers win over the socket peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}
