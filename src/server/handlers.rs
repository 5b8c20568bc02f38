//! Route handlers. Plain-text bodies for the list endpoints, JSON for the
//! debug endpoints and the update trigger, HTML for the catalogue pages.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use super::TARGET;
use super::ip::client_ip;
use super::pages;
use crate::App;
use crate::app::store::MirrorFilter;
use crate::app::{processor, selector};
use crate::types::{ApiError, MirrorState};

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::UnknownRepoAttribute(message) => {
                (StatusCode::NOT_FOUND, message).into_response()
            }
            ApiError::Unauthorized => (
                StatusCode::FORBIDDEN,
                Json(status_payload("error", "Authentication failed")),
            )
                .into_response(),
            ApiError::Internal(report) => {
                tracing::error!(target: TARGET, "Internal error: {report:?}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

fn status_payload(status: &str, message: &str) -> serde_json::Value {
    json!({
        "status": status,
        "result": { "message": message },
        "timestamp": chrono::Utc::now().timestamp(),
    })
}

fn validate_protocol(protocol: Option<&str>) -> Result<(), ApiError> {
    match protocol {
        None | Some("http") | Some("https") => Ok(()),
        Some(other) => Err(ApiError::UnknownRepoAttribute(format!(
            "Unknown protocol {other:?}. Allowed list of protocols \"http, https\""
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct MirrorlistQuery {
    protocol: Option<String>,
    country: Option<String>,
    arch: Option<String>,
}

pub(super) async fn mirrorlist(
    State(app): State<Arc<App>>,
    Path((version, repository)): Path<(String, String)>,
    Query(query): Query<MirrorlistQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    validate_protocol(query.protocol.as_deref())?;
    let request = selector::SelectionRequest {
        ip: client_ip(&headers, peer),
        version,
        repository: Some(repository),
        arch: query.arch,
        protocol: query.protocol,
        country: query.country,
        module: None,
        iso_list: false,
    };
    let urls = selector::mirrorlist(&app, &request).await?;
    Ok(plain_text(urls.join("\n")))
}

pub(super) async fn isolist(
    State(app): State<Arc<App>>,
    Path((version, arch)): Path<(String, String)>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    let request = selector::SelectionRequest {
        ip: client_ip(&headers, peer),
        version,
        repository: None,
        arch: Some(arch),
        protocol: None,
        country: None,
        module: None,
        iso_list: true,
    };
    let urls = selector::mirrorlist(&app, &request).await?;
    Ok(plain_text(urls.join("\n")))
}

fn plain_text(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

pub(super) async fn mirrors_table(
    State(app): State<Arc<App>>,
) -> Result<Html<String>, ApiError> {
    let mirrors = app
        .store
        .list(MirrorFilter {
            without_private: true,
            ..Default::default()
        })
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    pages::mirrors_table_page(&mirrors).map(Html)
}

pub(super) async fn isos_main(State(app): State<Arc<App>>) -> Result<Html<String>, ApiError> {
    let config = app.service_config().await;
    pages::isos_main_page(&selector::main_isos_table(&config)).map(Html)
}

pub(super) async fn isos_listing(
    State(app): State<Arc<App>>,
    Path((arch, version)): Path<(String, String)>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Html<String>, ApiError> {
    let ip = client_ip(&headers, peer);
    let (by_country, nearest) = selector::isos_by_countries(&app, ip).await?;
    pages::isos_listing_page(&arch, &version, &by_country, &nearest).map(Html)
}

pub(super) async fn ip_info(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Json<serde_json::Value> {
    let ip = client_ip(&headers, peer);
    let geodata = ip.and_then(|ip| app.geo.geo(ip));
    Json(json!({
        "ip": ip.map(|ip| ip.to_string()),
        "asn": ip.and_then(|ip| app.geo.asn(ip)),
        "geodata": geodata,
    }))
}

pub(super) async fn nearest_mirrors(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = app.service_config().await;
    let ip = client_ip(&headers, peer);
    let geodata = ip.and_then(|ip| app.geo.geo(ip));
    let selected = selector::nearest_mirrors(
        &app,
        &config,
        MirrorFilter::mirrorlist(false),
        ip,
        None,
        None,
        None,
    )
    .await?;
    let mirrors: BTreeMap<String, &MirrorState> = selected
        .iter()
        .map(|mirror| (mirror.name.clone(), mirror))
        .collect();
    Ok(Json(json!({
        "ip": ip.map(|ip| ip.to_string()),
        "geodata": geodata,
        "mirrors": mirrors,
    })))
}

pub(super) async fn all_mirrors(
    State(app): State<Arc<App>>,
) -> Result<Json<Vec<MirrorState>>, ApiError> {
    let mirrors = app
        .store
        .list(MirrorFilter::default())
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    Ok(Json((*mirrors).clone()))
}

pub(super) async fn update_mirrors(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let expected = std::env::var("UPDATE_AUTH_KEY").map_err(|_| ApiError::Unauthorized)?;
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    if presented != expected {
        return Err(ApiError::Unauthorized);
    }
    Ok(match processor::run_update(&app).await {
        Ok(message) => Json(status_payload("success", &message)).into_response(),
        Err(err) => {
            tracing::error!(target: TARGET, "Mirror update failed: {err:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(status_payload("error", "Internal server error")),
            )
                .into_response()
        }
    })
}
