//! Integration tests for the auth pipeline: signing, replay defense, bearer
//! tokens, payload encryption and response signing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::header;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use lariat::auth::{
    authenticate, canonical_block, Authenticator, Claims, FixedCryptorResolver,
    FixedSignerResolver, SignFields, CONTENT_TYPE_ENCRYPTED,
};
use lariat::crypto::{AesGcmCryptor, Cryptor, HmacSha256Signer, Signer};
use lariat::kv::{KvError, KvStore, MemoryKv};

const SIGN_SECRET: &[u8] = b"k";
const JWT_SECRET: &[u8] = b"jwt test secret";
const CRYPT_KEY: [u8; 32] = [42u8; 32];

async fn ping() -> impl IntoResponse {
    Json(json!({"message": "pong"}))
}

/// Echoes the request body and reports the Content-Type it observed, so
/// tests can see what reached the handler after decryption.
async fn echo(headers: axum::http::HeaderMap, body: Bytes) -> impl IntoResponse {
    let seen = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    Json(json!({"ok": true, "seen_content_type": seen, "body": String::from_utf8_lossy(&body)}))
}

async fn private(claims: Claims) -> String {
    format!("{}:{}", claims.user_id, claims.role)
}

/// Reports whether optional claims were exposed.
async fn optional(request: axum::extract::Request) -> String {
    match request.extensions().get::<Claims>() {
        Some(claims) => format!("user:{}", claims.user_id),
        None => "anonymous".to_string(),
    }
}

fn build_authenticator(kv: Arc<dyn KvStore>) -> Authenticator {
    let signer: Arc<dyn Signer> = Arc::new(HmacSha256Signer::new(SIGN_SECRET.to_vec()));
    let cryptor: Arc<dyn Cryptor> = Arc::new(AesGcmCryptor::new(&CRYPT_KEY));
    Authenticator::new(kv, Arc::new(FixedSignerResolver::new(signer)))
        .with_cryptor_resolver(Arc::new(FixedCryptorResolver::new(cryptor)))
        .with_allow_methods(vec!["GET".to_string(), "POST".to_string()])
        .with_crypt_paths(vec!["/api/secure".to_string()], Vec::new())
        .with_auth_paths(
            vec!["/api/private".to_string()],
            vec!["/api/open".to_string()],
        )
        .with_jwt("lariat-test", Duration::from_secs(3600), JWT_SECRET)
}

async fn start_server_with(auth: Arc<Authenticator>) -> SocketAddr {
    let app = Router::new()
        .route("/ping", get(ping))
        .route("/api/secure", post(echo))
        .route("/api/private", get(private))
        .route("/api/open", get(optional))
        .layer(middleware::from_fn_with_state(auth, authenticate));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start_server() -> (SocketAddr, Arc<Authenticator>) {
    let auth = Arc::new(build_authenticator(Arc::new(MemoryKv::new())));
    let addr = start_server_with(auth.clone()).await;
    (addr, auth)
}

struct SignedRequest {
    method: reqwest::Method,
    path: String,
    query: String,
    body: Vec<u8>,
    nonce: String,
    timestamp: i64,
    content_type: Option<String>,
    bearer: Option<String>,
}

impl SignedRequest {
    fn get(path: &str, nonce: &str) -> SignedRequest {
        SignedRequest {
            method: reqwest::Method::GET,
            path: path.to_string(),
            query: String::new(),
            body: Vec::new(),
            nonce: nonce.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            content_type: None,
            bearer: None,
        }
    }

    fn post(path: &str, nonce: &str, body: Vec<u8>) -> SignedRequest {
        SignedRequest {
            method: reqwest::Method::POST,
            body,
            ..SignedRequest::get(path, nonce)
        }
    }
}

/// Signs and sends a request the way a conforming client would.
async fn send_signed(addr: SocketAddr, req: SignedRequest) -> reqwest::Response {
    let timestamp = req.timestamp.to_string();
    let block = canonical_block(&SignFields {
        nonce: &req.nonce,
        timestamp: &timestamp,
        platform: "8",
        method: req.method.as_str(),
        path: &req.path,
        query: &req.query,
        body: &req.body,
    });
    let signer = HmacSha256Signer::new(SIGN_SECRET.to_vec());
    let signature = signer.sign_base64(&block).unwrap();

    let url = if req.query.is_empty() {
        format!("http://{}{}", addr, req.path)
    } else {
        format!("http://{}{}?{}", addr, req.path, req.query)
    };
    let client = reqwest::Client::new();
    let mut builder = client
        .request(req.method, url)
        .header("x-niu-nonce", &req.nonce)
        .header("x-niu-timestamp", &timestamp)
        .header("x-niu-signature", &signature)
        .header("x-platform", "8")
        .body(req.body);
    if let Some(content_type) = &req.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    if let Some(bearer) = &req.bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {bearer}"));
    }
    builder.send().await.unwrap()
}

#[tokio::test]
async fn signed_request_round_trip() {
    let (addr, _auth) = start_server().await;

    let response = send_signed(addr, SignedRequest::get("/ping", "nonce-rt-1")).await;
    assert_eq!(response.status(), 200);

    // The three signing headers plus the CORS expose header come back.
    let resp_nonce = response.headers()["x-niu-nonce"].to_str().unwrap().to_string();
    let resp_timestamp = response.headers()["x-niu-timestamp"].to_str().unwrap().to_string();
    let resp_signature = response.headers()["x-niu-signature"].to_str().unwrap().to_string();
    assert_eq!(
        response.headers()["access-control-expose-headers"],
        "x-niu-timestamp,x-niu-nonce,x-niu-signature"
    );
    assert_eq!(resp_nonce.len(), 32, "uuid hex without dashes");
    assert!(!resp_nonce.contains('-'));

    // The response signature verifies over the canonical block built from
    // the response body and the fresh nonce/timestamp pair.
    let body = response.bytes().await.unwrap();
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&body).unwrap()["message"],
        "pong"
    );
    let block = canonical_block(&SignFields {
        nonce: &resp_nonce,
        timestamp: &resp_timestamp,
        platform: "8",
        method: "GET",
        path: "/ping",
        query: "",
        body: &body,
    });
    let signer = HmacSha256Signer::new(SIGN_SECRET.to_vec());
    assert!(signer.verify_base64(&block, &resp_signature));
}

#[tokio::test]
async fn signature_computed_independently_is_accepted() {
    // A client that never touches this crate signs the documented block by
    // hand; the pipeline must accept it.
    let (addr, _auth) = start_server().await;

    let nonce = "independent-nonce";
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let block_text = format!(
        "body=\nmethod=GET\nnonce={nonce}\npath=/ping\nplatform=8\nquery=\ntimestamp={timestamp}\n"
    );
    let mut mac = Hmac::<Sha256>::new_from_slice(SIGN_SECRET).unwrap();
    mac.update(block_text.as_bytes());
    let signature =
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, mac.finalize().into_bytes());

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/ping", addr))
        .header("x-niu-nonce", nonce)
        .header("x-niu-timestamp", &timestamp)
        .header("x-niu-signature", &signature)
        .header("x-platform", "8")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn replayed_nonce_is_rejected() {
    let (addr, _auth) = start_server().await;

    let first = send_signed(addr, SignedRequest::get("/ping", "nonce-replay")).await;
    assert_eq!(first.status(), 200);

    let second = send_signed(addr, SignedRequest::get("/ping", "nonce-replay")).await;
    assert_eq!(second.status(), 400);
}

#[tokio::test]
async fn stale_and_future_timestamps_are_rejected() {
    let (addr, _auth) = start_server().await;

    let mut stale = SignedRequest::get("/ping", "nonce-stale");
    stale.timestamp = chrono::Utc::now().timestamp() - 400;
    assert_eq!(send_signed(addr, stale).await.status(), 400);

    let mut future = SignedRequest::get("/ping", "nonce-future");
    future.timestamp = chrono::Utc::now().timestamp() + 400;
    assert_eq!(send_signed(addr, future).await.status(), 400);

    // Inside the window is fine.
    let mut recent = SignedRequest::get("/ping", "nonce-recent");
    recent.timestamp = chrono::Utc::now().timestamp() - 250;
    assert_eq!(send_signed(addr, recent).await.status(), 200);
}

#[tokio::test]
async fn missing_or_malformed_headers_are_rejected() {
    let (addr, _auth) = start_server().await;
    let client = reqwest::Client::new();

    // No signing headers at all.
    let response = client
        .get(format!("http://{}/ping", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Invalid platform value.
    let response = client
        .get(format!("http://{}/ping", addr))
        .header("x-niu-nonce", "n")
        .header("x-niu-timestamp", chrono::Utc::now().timestamp().to_string())
        .header("x-niu-signature", "sig")
        .header("x-platform", "99")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let (addr, _auth) = start_server().await;

    let timestamp = chrono::Utc::now().timestamp().to_string();
    let block = canonical_block(&SignFields {
        nonce: "nonce-tamper",
        timestamp: &timestamp,
        platform: "8",
        method: "GET",
        path: "/ping",
        query: "",
        body: b"",
    });
    let signer = HmacSha256Signer::new(SIGN_SECRET.to_vec());
    let signature = signer.sign_base64(&block).unwrap();

    // Sign for /ping but request /api/open: the canonical block differs.
    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/api/open", addr))
        .header("x-niu-nonce", "nonce-tamper")
        .header("x-niu-timestamp", &timestamp)
        .header("x-niu-signature", &signature)
        .header("x-platform", "8")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn disallowed_method_is_rejected() {
    let (addr, _auth) = start_server().await;
    let mut req = SignedRequest::get("/ping", "nonce-method");
    req.method = reqwest::Method::DELETE;
    assert_eq!(send_signed(addr, req).await.status(), 405);
}

#[tokio::test]
async fn auth_path_requires_a_valid_bearer_token() {
    let (addr, auth) = start_server().await;

    // No token.
    let response = send_signed(addr, SignedRequest::get("/api/private", "nonce-auth-1")).await;
    assert_eq!(response.status(), 401);

    // Garbage token.
    let mut req = SignedRequest::get("/api/private", "nonce-auth-2");
    req.bearer = Some("garbage".to_string());
    assert_eq!(send_signed(addr, req).await.status(), 401);

    // Valid token: claims reach the handler.
    let token = auth.generate_token(42, "admin", "8").unwrap();
    let mut req = SignedRequest::get("/api/private", "nonce-auth-3");
    req.bearer = Some(token);
    let response = send_signed(addr, req).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "42:admin");
}

#[tokio::test]
async fn revoked_token_is_rejected_on_auth_paths() {
    let (addr, auth) = start_server().await;

    let token = auth.generate_token(7, "user", "8").unwrap();
    auth.revoke_token(&token).await.unwrap();
    assert!(auth.is_token_revoked(&token).await.unwrap());

    let mut req = SignedRequest::get("/api/private", "nonce-revoked");
    req.bearer = Some(token);
    assert_eq!(send_signed(addr, req).await.status(), 401);
}

#[tokio::test]
async fn optional_auth_exposes_claims_when_present() {
    let (addr, auth) = start_server().await;

    // Without a token the excluded path still serves.
    let response = send_signed(addr, SignedRequest::get("/api/open", "nonce-opt-1")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "anonymous");

    // With a valid token, claims are exposed.
    let token = auth.generate_token(9, "user", "8").unwrap();
    let mut req = SignedRequest::get("/api/open", "nonce-opt-2");
    req.bearer = Some(token);
    let response = send_signed(addr, req).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "user:9");

    // An invalid token on an optional path is silently ignored.
    let mut req = SignedRequest::get("/api/open", "nonce-opt-3");
    req.bearer = Some("broken".to_string());
    let response = send_signed(addr, req).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "anonymous");
}

#[tokio::test]
async fn encrypted_post_round_trip() {
    let (addr, _auth) = start_server().await;
    let cryptor = AesGcmCryptor::new(&CRYPT_KEY);

    let ciphertext = cryptor.encrypt(br#"{"x":1}"#).unwrap();
    let mut req = SignedRequest::post("/api/secure", "nonce-enc-1", ciphertext);
    req.content_type = Some(CONTENT_TYPE_ENCRYPTED.to_string());
    let response = send_signed(addr, req).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        CONTENT_TYPE_ENCRYPTED,
        "response body must be encrypted on crypt paths"
    );

    let resp_nonce = response.headers()["x-niu-nonce"].to_str().unwrap().to_string();
    let resp_timestamp = response.headers()["x-niu-timestamp"].to_str().unwrap().to_string();
    let resp_signature = response.headers()["x-niu-signature"].to_str().unwrap().to_string();

    let encrypted_body = response.bytes().await.unwrap();

    // The response signature covers the ciphertext, not the plaintext.
    let block = canonical_block(&SignFields {
        nonce: &resp_nonce,
        timestamp: &resp_timestamp,
        platform: "8",
        method: "POST",
        path: "/api/secure",
        query: "",
        body: &encrypted_body,
    });
    let signer = HmacSha256Signer::new(SIGN_SECRET.to_vec());
    assert!(signer.verify_base64(&block, &resp_signature));

    // The handler saw the decrypted JSON with the rewritten Content-Type.
    let plaintext = cryptor.decrypt(&encrypted_body).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(value["ok"], true);
    assert_eq!(value["seen_content_type"], "application/json");
    assert_eq!(value["body"], r#"{"x":1}"#);
}

#[tokio::test]
async fn encrypted_path_requires_the_encrypted_media_type() {
    let (addr, _auth) = start_server().await;
    let cryptor = AesGcmCryptor::new(&CRYPT_KEY);

    let ciphertext = cryptor.encrypt(br#"{"x":1}"#).unwrap();
    let mut req = SignedRequest::post("/api/secure", "nonce-enc-2", ciphertext);
    req.content_type = Some("application/json".to_string());
    assert_eq!(send_signed(addr, req).await.status(), 400);
}

#[tokio::test]
async fn undecryptable_body_is_rejected() {
    let (addr, _auth) = start_server().await;

    let mut req = SignedRequest::post("/api/secure", "nonce-enc-3", b"not ciphertext".to_vec());
    req.content_type = Some(CONTENT_TYPE_ENCRYPTED.to_string());
    assert_eq!(send_signed(addr, req).await.status(), 400);
}

#[tokio::test]
async fn decrypt_content_type_override_applies() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let auth = Arc::new(
        build_authenticator(kv).with_decrypt_content_type(HashMap::from([(
            "/api/secure".to_string(),
            "application/msgpack".to_string(),
        )])),
    );
    let addr = start_server_with(auth).await;

    let cryptor = AesGcmCryptor::new(&CRYPT_KEY);
    let ciphertext = cryptor.encrypt(b"\x81\xa1x\x01").unwrap();
    let mut req = SignedRequest::post("/api/secure", "nonce-ct-1", ciphertext);
    req.content_type = Some(CONTENT_TYPE_ENCRYPTED.to_string());
    let response = send_signed(addr, req).await;
    assert_eq!(response.status(), 200);

    let plaintext = cryptor.decrypt(&response.bytes().await.unwrap()).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(value["seen_content_type"], "application/msgpack");
}

/// KV store that fails every call, for the unreachable-store path.
struct BrokenKv;

#[async_trait]
impl KvStore for BrokenKv {
    async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, KvError> {
        Err(KvError::Unreachable("connection refused".to_string()))
    }
    async fn delete_if_equals(&self, _: &str, _: &str) -> Result<bool, KvError> {
        Err(KvError::Unreachable("connection refused".to_string()))
    }
    async fn set_add(&self, _: &str, _: &str) -> Result<(), KvError> {
        Err(KvError::Unreachable("connection refused".to_string()))
    }
    async fn set_contains(&self, _: &str, _: &str) -> Result<bool, KvError> {
        Err(KvError::Unreachable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn unreachable_kv_store_is_a_server_error() {
    let auth = Arc::new(build_authenticator(Arc::new(BrokenKv)));
    let addr = start_server_with(auth).await;

    let response = send_signed(addr, SignedRequest::get("/ping", "nonce-kv-down")).await;
    assert_eq!(response.status(), 500);
}
