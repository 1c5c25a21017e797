//! HTTP request handlers for the ETSI GS QKD 014 API
//!
//! Every API request moves through RECEIVED, VALIDATED, AUTHORIZED and
//! PROCESSED before a response is written. Nothing is kept between requests;
//! the caller's SAE_ID comes from the TLS connection and its registration is
//! looked up again for each request.

use crate::config::KmeConfig;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE, SERVER};
use hyper::{Method, Request, Response, StatusCode};
use qkme_core::auth::SaeRegistry;
use qkme_core::extensions::{self, ExtensionRegistry};
use qkme_core::*;
use qkme_engine::{DeliveredKey, KeyDistributionEngine};
use qkme_net::*;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub type BoxBody = Full<Bytes>;

/// Shared state handed to every request
pub struct AppState {
    pub kme_id: KmeId,
    pub peer_kme_id: KmeId,
    pub engine: KeyDistributionEngine,
    pub registry: Arc<dyn SaeRegistry>,
    pub extensions: ExtensionRegistry,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(
        config: &KmeConfig,
        engine: KeyDistributionEngine,
        registry: Arc<dyn SaeRegistry>,
    ) -> Result<Self> {
        Ok(AppState {
            kme_id: KmeId::new(&config.kme_id)?,
            peer_kme_id: KmeId::new(&config.peer_kme_id)?,
            engine,
            registry,
            extensions: ExtensionRegistry::default(),
            request_timeout: config.request_timeout(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Received,
    Validated,
    Authorized,
    Processed,
}

fn enter(route: &ApiRoute, phase: Phase) {
    debug!("{} {} {:?}", route.endpoint, route.sae_id, phase);
}

/// Main request handler
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<AppState>,
    caller: Option<SaeId>,
) -> std::result::Result<Response<BoxBody>, Infallible>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result =
        match tokio::time::timeout(state.request_timeout, route(req, &state, caller.as_ref())).await
        {
            Ok(result) => result,
            Err(_) => Err(KmeError::ResourceExhausted(format!(
                "request did not complete within {:?}",
                state.request_timeout
            ))),
        };

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            match e.http_status() {
                400 => debug!("Rejected {} {}: {}", method, path, e),
                401 => warn!("Refused {} {}: {}", method, path, e),
                _ => error!("Handler error for {} {}: {}", method, path, e),
            }
            error_response(&e)
        }
    };

    info!("{} {} -> {}", method, path, response.status());
    Ok(response)
}

async fn route<B>(
    req: Request<B>,
    state: &AppState,
    caller: Option<&SaeId>,
) -> Result<Response<BoxBody>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.uri().path() == "/health" {
        return match *req.method() {
            Method::GET => handle_health(state),
            _ => Ok(method_not_allowed()),
        };
    }

    let Some(route) = parse_api_path(req.uri().path()).transpose() else {
        return Ok(not_found());
    };

    // Unauthenticated callers learn nothing about path validity
    let caller = authenticate(state, caller)?;
    let route = route?;
    enter(&route, Phase::Received);

    let response = match (route.endpoint, req.method().clone()) {
        (Endpoint::Status, Method::GET) => handle_status(state, &caller, &route)?,
        (Endpoint::EncKeys, Method::GET) => {
            let request = parse_enc_keys_query(req.uri().query())?;
            handle_enc_keys(state, &caller, &route, request).await?
        }
        (Endpoint::EncKeys, Method::POST) => {
            let body = read_body(req).await?;
            let request = decode_key_request(&body)?;
            handle_enc_keys(state, &caller, &route, request).await?
        }
        (Endpoint::DecKeys, Method::GET) => {
            let key_ids = parse_dec_keys_query(req.uri().query())?;
            handle_dec_keys(state, &caller, &route, key_ids)?
        }
        (Endpoint::DecKeys, Method::POST) => {
            let body = read_body(req).await?;
            let key_ids = decode_key_ids(&body)?;
            handle_dec_keys(state, &caller, &route, key_ids)?
        }
        _ => return Ok(method_not_allowed()),
    };

    enter(&route, Phase::Processed);
    Ok(response)
}

/// Current registration of the SAE behind the connection
fn authenticate(state: &AppState, caller: Option<&SaeId>) -> Result<SaeIdentity> {
    let sae_id = caller.ok_or_else(|| {
        KmeError::Authentication("connection has no authenticated SAE".to_string())
    })?;

    state
        .registry
        .lookup(sae_id)
        .ok_or_else(|| KmeError::Authentication(format!("SAE {} is no longer registered", sae_id)))
}

async fn read_body<B>(req: Request<B>) -> std::result::Result<Bytes, ProtocolError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if let Some(length) = req.body().size_hint().exact() {
        if length as usize > MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLarge(length as usize, MAX_BODY_SIZE));
        }
    }

    Limited::new(req.into_body(), MAX_BODY_SIZE)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ProtocolError::MalformedBody(e.to_string()))
}

/// Health check handler
fn handle_health(state: &AppState) -> Result<Response<BoxBody>> {
    let levels = state.engine.manager().store().levels();
    json_response(
        StatusCode::OK,
        &json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "service": "qkme",
            "kme_id": state.kme_id.as_str(),
            "stored_key_count": levels.stored_key_count,
        }),
    )
}

/// `GET /api/v1/keys/{slave_SAE_ID}/status`
fn handle_status(
    state: &AppState,
    caller: &SaeIdentity,
    route: &ApiRoute,
) -> Result<Response<BoxBody>> {
    enter(route, Phase::Validated);
    state.engine.authorize_status(caller, &route.sae_id)?;
    enter(route, Phase::Authorized);

    let pool = state.engine.manager().status(caller);
    let status = Status {
        source_kme_id: state.kme_id.to_string(),
        target_kme_id: state.peer_kme_id.to_string(),
        master_sae_id: caller.sae_id.to_string(),
        slave_sae_id: route.sae_id.to_string(),
        key_size: pool.key_size,
        stored_key_count: pool.levels.stored_key_count,
        max_key_count: pool.levels.max_key_count,
        max_key_per_request: pool.limits.max_key_per_request,
        max_key_size: pool.limits.max_key_size,
        min_key_size: pool.limits.min_key_size,
        max_sae_id_count: pool.limits.max_sae_id_count,
        status_extension: Some(json!({
            "low_watermark": pool.low_watermark,
            "replenishing": pool.replenishing,
        })),
    };

    json_response(StatusCode::OK, &status)
}

/// `enc_keys`: the caller is the master, the path names the slave
async fn handle_enc_keys(
    state: &AppState,
    caller: &SaeIdentity,
    route: &ApiRoute,
    request: KeyRequest,
) -> Result<Response<BoxBody>> {
    let additional = request
        .additional_slave_sae_ids
        .iter()
        .map(|id| {
            SaeId::new(id).map_err(|_| {
                KmeError::invalid(
                    "additional_slave_SAE_IDs",
                    format!("'{}' is not a 16-character alphanumeric SAE_ID", id),
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mandatory = extensions::collect_parameters(&request.extension_mandatory, true);
    let optional = extensions::collect_parameters(&request.extension_optional, false);
    let applied = extensions::process(&mandatory, &optional, &state.extensions)?;
    enter(route, Phase::Validated);

    state.engine.authorize_request(caller, &route.sae_id)?;
    enter(route, Phase::Authorized);

    let keys = state
        .engine
        .request_keys(
            caller,
            &route.sae_id,
            request.number,
            request.size,
            &additional,
            &applied,
        )
        .await?;

    json_response(
        StatusCode::OK,
        &key_container(keys, applied.to_container_extension()),
    )
}

/// `dec_keys`: the caller is a slave, the path names the master
fn handle_dec_keys(
    state: &AppState,
    caller: &SaeIdentity,
    route: &ApiRoute,
    key_ids: KeyIds,
) -> Result<Response<BoxBody>> {
    let ids = key_ids.ids();
    enter(route, Phase::Validated);

    // Authorized per key inside the pool transaction
    let keys = state
        .engine
        .retrieve_keys_by_id(caller, &route.sae_id, &ids)?;
    enter(route, Phase::Authorized);

    json_response(StatusCode::OK, &key_container(keys, None))
}

fn key_container(
    keys: Vec<DeliveredKey>,
    extension: Option<serde_json::Value>,
) -> KeyContainer {
    KeyContainer {
        keys: keys
            .iter()
            .map(|key| Key::new(&key.key_id, &key.material))
            .collect(),
        key_container_extension: extension,
    }
}

/// Simple HTTP response builder
pub fn simple_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(SERVER, HeaderValue::from_static("qkme/0.1.0"));
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<BoxBody>> {
    Ok(simple_response(status, serde_json::to_vec(body)?))
}

/// ETSI error body with the status mandated for `e`
pub fn error_response(e: &KmeError) -> Response<BoxBody> {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);

    match serde_json::to_vec(&ErrorResponse::from(e)) {
        Ok(body) => simple_response(status, body),
        Err(_) => simple_response(status, r#"{"message":"Service temporarily unavailable"}"#),
    }
}

fn not_found() -> Response<BoxBody> {
    simple_response(
        StatusCode::NOT_FOUND,
        json!({"message": "Not found"}).to_string(),
    )
}

fn method_not_allowed() -> Response<BoxBody> {
    simple_response(
        StatusCode::METHOD_NOT_ALLOWED,
        json!({"message": "Method not allowed"}).to_string(),
    )
}
