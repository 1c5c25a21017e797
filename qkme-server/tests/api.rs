//! ETSI API behaviour through the request handler

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use qkme_core::auth::InMemorySaeRegistry;
use qkme_core::*;
use qkme_engine::*;
use qkme_server::{handle_request, AppState, KmeConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const MASTER: &str = "MMMMMMMMMMMMMMMM";
const SLAVE: &str = "SSSSSSSSSSSSSSSS";
const OUTSIDER: &str = "TTTTTTTTTTTTTTTT";

fn identity(id: &str) -> SaeIdentity {
    SaeIdentity {
        sae_id: SaeId::new(id).unwrap(),
        fingerprint: "00".repeat(32),
        status: SaeStatus::Active,
        limits: SaeLimits::default(),
    }
}

fn config() -> KmeConfig {
    let mut config = KmeConfig::default();
    config.pool.max_key_count = 10;
    config.pool.low_watermark = 0;
    config.pool.emergency_max_keys = 0;
    config
}

async fn app_with(config: KmeConfig, link: SimulatedQkdLink, fill: bool) -> Arc<AppState> {
    let pool_config = config.pool_config();
    let store = Arc::new(KeyPoolStore::in_memory(
        pool_config.max_key_count,
        pool_config.retirement,
    ));
    let manager = KeyPoolManager::new(store, Arc::new(link), pool_config);
    if fill {
        manager.replenish().await.unwrap();
    }

    let registry = Arc::new(InMemorySaeRegistry::from_identities(
        [MASTER, SLAVE, OUTSIDER].into_iter().map(identity),
    ));
    let engine = KeyDistributionEngine::new(
        manager,
        AuthorizationEngine::new(AuditLog::new()),
        registry.clone(),
    );
    Arc::new(AppState::new(&config, engine, registry).unwrap())
}

async fn app() -> Arc<AppState> {
    app_with(config(), SimulatedQkdLink::new(Duration::ZERO, 256), true).await
}

async fn call(
    state: &Arc<AppState>,
    caller: Option<&str>,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let body = body.map(|v| v.to_string()).unwrap_or_default();
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::from(body)))
        .unwrap();

    let caller = caller.map(|id| SaeId::new(id).unwrap());
    let response = handle_request(req, state.clone(), caller).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn key_ids(container: &Value) -> Vec<Value> {
    container["keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|key| json!({"key_ID": key["key_ID"]}))
        .collect()
}

fn stored(state: &AppState) -> u64 {
    state.engine.manager().store().levels().stored_key_count
}

#[tokio::test]
async fn master_slave_outsider_scenario() {
    let state = app().await;
    let enc = format!("/api/v1/keys/{}/enc_keys", SLAVE);
    let dec = format!("/api/v1/keys/{}/dec_keys", MASTER);

    let (status, container) = call(
        &state,
        Some(MASTER),
        Method::POST,
        &enc,
        Some(json!({"number": 2, "size": 256})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let keys = container["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 2);
    // 32 bytes of Base64 with padding
    assert!(keys.iter().all(|k| k["key"].as_str().unwrap().len() == 44));
    assert!(container.get("key_container_extension").is_none());

    let ids = json!({ "key_IDs": key_ids(&container) });

    let (status, body) = call(&state, Some(OUTSIDER), Method::POST, &dec, Some(ids.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["message"].is_string());

    let (status, retrieved) = call(&state, Some(SLAVE), Method::POST, &dec, Some(ids.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retrieved["keys"], container["keys"]);

    let (status, _) = call(&state, Some(SLAVE), Method::POST, &dec, Some(ids)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn status_reports_pool_and_limits() {
    let state = app().await;
    let (status, body) = call(
        &state,
        Some(MASTER),
        Method::GET,
        &format!("/api/v1/keys/{}/status", SLAVE),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source_KME_ID"], "KME0000000000001");
    assert_eq!(body["target_KME_ID"], "KME0000000000002");
    assert_eq!(body["master_SAE_ID"], MASTER);
    assert_eq!(body["slave_SAE_ID"], SLAVE);
    assert_eq!(body["key_size"], 256);
    assert_eq!(body["stored_key_count"], 10);
    assert_eq!(body["max_key_count"], 10);
    assert_eq!(body["max_key_per_request"], 128);
    assert_eq!(body["max_SAE_ID_count"], 2);
    assert_eq!(body["status_extension"]["low_watermark"], 0);
}

#[tokio::test]
async fn invalid_requests_get_400_with_details() {
    let state = app().await;
    let enc = format!("/api/v1/keys/{}/enc_keys", SLAVE);

    let (status, body) = call(&state, Some(MASTER), Method::POST, &enc, Some(json!({"size": 100}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["parameter"], "size");

    let (status, body) = call(&state, Some(MASTER), Method::POST, &enc, Some(json!({"number": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["parameter"], "number");

    let (status, body) = call(
        &state,
        Some(MASTER),
        Method::POST,
        &enc,
        Some(json!({"additional_slave_SAE_IDs": ["short"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["parameter"], "additional_slave_SAE_IDs");

    let (status, body) = call(
        &state,
        Some(MASTER),
        Method::GET,
        "/api/v1/keys/short/status",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["parameter"], "slave_SAE_ID");

    let (status, body) = call(
        &state,
        Some(SLAVE),
        Method::POST,
        &format!("/api/v1/keys/{}/dec_keys", MASTER),
        Some(json!({"key_IDs": [{"key_ID": "not-a-uuid"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["parameter"], "key_ID");

    assert_eq!(stored(&state), 10);
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let state = app().await;
    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("/api/v1/keys/{}/enc_keys", SLAVE))
        .body(Full::new(Bytes::from_static(b"{not json")))
        .unwrap();

    let response = handle_request(req, state, Some(SaeId::new(MASTER).unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unsupported_mandatory_extension_fails_before_reservation() {
    let state = app().await;
    let (status, body) = call(
        &state,
        Some(MASTER),
        Method::POST,
        &format!("/api/v1/keys/{}/enc_keys", SLAVE),
        Some(json!({"extension_mandatory": [{"abc_route_type": "direct"}]})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["parameter"], "extension_mandatory");
    assert_eq!(stored(&state), 10);
}

#[tokio::test]
async fn applied_extensions_are_echoed() {
    let state = app().await;
    let (status, body) = call(
        &state,
        Some(MASTER),
        Method::POST,
        &format!("/api/v1/keys/{}/enc_keys", SLAVE),
        Some(json!({
            "extension_mandatory": [{"route_type": "direct"}],
            "extension_optional": [{"unknown_option": true}, {"max_age": 60}],
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["key_container_extension"],
        json!({"route_type": "direct", "max_age": 60})
    );
}

#[tokio::test]
async fn unauthenticated_callers_get_401() {
    let state = app().await;
    let status_path = format!("/api/v1/keys/{}/status", SLAVE);

    let (status, _) = call(&state, None, Method::GET, &status_path, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Authentication is checked before path validation
    let (status, _) = call(&state, None, Method::GET, "/api/v1/keys/short/status", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&state, Some("UUUUUUUUUUUUUUUU"), Method::GET, &status_path, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn exhaustion_returns_503_and_keeps_pool() {
    let state = app().await;
    let (status, body) = call(
        &state,
        Some(MASTER),
        Method::POST,
        &format!("/api/v1/keys/{}/enc_keys", SLAVE),
        Some(json!({"number": 20})),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["message"].as_str().unwrap().contains("exhausted"));
    assert_eq!(stored(&state), 10);
}

#[tokio::test]
async fn get_variants_match_post_semantics() {
    let state = app().await;

    let (status, container) = call(
        &state,
        Some(MASTER),
        Method::GET,
        &format!("/api/v1/keys/{}/enc_keys?number=1&size=256", SLAVE),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let key_id = container["keys"][0]["key_ID"].as_str().unwrap().to_string();

    let (status, retrieved) = call(
        &state,
        Some(SLAVE),
        Method::GET,
        &format!("/api/v1/keys/{}/dec_keys?key_ID={}", MASTER, key_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retrieved["keys"][0]["key"], container["keys"][0]["key"]);
}

#[tokio::test]
async fn health_and_unknown_routes() {
    let state = app().await;

    let (status, body) = call(&state, None, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["stored_key_count"], 10);

    let (status, _) = call(&state, Some(MASTER), Method::GET, "/api/v2/keys", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &state,
        Some(MASTER),
        Method::DELETE,
        &format!("/api/v1/keys/{}/status", SLAVE),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn request_deadline_returns_503_without_leaking_keys() {
    let mut config = config();
    config.request_timeout_ms = 20;
    config.pool.emergency_max_keys = 4;
    config.pool.emergency_timeout_ms = 5_000;
    let state = app_with(
        config,
        SimulatedQkdLink::new(Duration::from_millis(300), 256),
        false,
    )
    .await;

    let (status, _) = call(
        &state,
        Some(MASTER),
        Method::POST,
        &format!("/api/v1/keys/{}/enc_keys", SLAVE),
        Some(json!({"number": 1})),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(stored(&state), 0);
}
