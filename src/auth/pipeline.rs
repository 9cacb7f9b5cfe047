//! Request authentication and secure-envelope middleware.
//!
//! One middleware runs the whole chain: method allow-list, signing-header
//! extraction, replay defense, body capture, signature verification over the
//! canonical block, bearer-token validation, request decryption, handler
//! invocation against a buffered response, response encryption, and response
//! signing. Any step can abort with a bare status code; clients never see
//! more detail than that.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::request::Parts;
use axum::http::{header, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::auth::canonical::{canonical_block, SignFields};
use crate::auth::headers::{
    SignHeaders, CONTENT_TYPE_ENCRYPTED, CONTENT_TYPE_JSON, HEADER_PLATFORM,
};
use crate::auth::jwt::{Claims, Tokens};
use crate::buffer::BufferPool;
use crate::crypto::{Cryptor, Signer};
use crate::kv::{KvError, KvStore};
use crate::platform::Platform;

/// Replay window: a nonce is unique for this long, and a request timestamp
/// may differ from server time by at most this much.
const REPLAY_WINDOW: Duration = Duration::from_secs(300);

/// KV key prefix for the replay cache.
const REPLAY_KEY_PREFIX: &str = "replay:";

/// KV set holding revoked bearer tokens.
const REVOKED_TOKENS_SET: &str = "revoked_tokens";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("signer resolution failed: {0}")]
    Resolver(String),

    #[error("jwt is not configured")]
    JwtNotConfigured,

    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Picks the signer for a request. Resolution happens per request so
/// multi-tenant deployments can key signers off headers or route data.
pub trait SignerResolver: Send + Sync {
    fn resolve(&self, parts: &Parts) -> Result<Arc<dyn Signer>, AuthError>;
}

/// Resolver that hands every request the same shared-secret signer.
pub struct FixedSignerResolver {
    signer: Arc<dyn Signer>,
}

impl FixedSignerResolver {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        FixedSignerResolver { signer }
    }
}

impl SignerResolver for FixedSignerResolver {
    fn resolve(&self, _parts: &Parts) -> Result<Arc<dyn Signer>, AuthError> {
        Ok(self.signer.clone())
    }
}

/// Picks the cryptor for a request on encrypted paths.
pub trait CryptorResolver: Send + Sync {
    fn resolve(&self, parts: &Parts) -> Result<Arc<dyn Cryptor>, AuthError>;
}

/// Resolver that hands every request the same cryptor.
pub struct FixedCryptorResolver {
    cryptor: Arc<dyn Cryptor>,
}

impl FixedCryptorResolver {
    pub fn new(cryptor: Arc<dyn Cryptor>) -> Self {
        FixedCryptorResolver { cryptor }
    }
}

impl CryptorResolver for FixedCryptorResolver {
    fn resolve(&self, _parts: &Parts) -> Result<Arc<dyn Cryptor>, AuthError> {
        Ok(self.cryptor.clone())
    }
}

/// The middleware's configuration and dependencies. Built once, shared via
/// `Arc`, attached with `axum::middleware::from_fn_with_state`.
pub struct Authenticator {
    headers: SignHeaders,
    kv: Arc<dyn KvStore>,
    signer_resolver: Arc<dyn SignerResolver>,
    cryptor_resolver: Option<Arc<dyn CryptorResolver>>,
    /// A `*` entry means every path; exact entries match case-insensitively.
    crypt_paths: Vec<String>,
    /// Excludes take precedence over `crypt_paths`.
    crypt_exclude_paths: Vec<String>,
    auth_paths: Vec<String>,
    auth_exclude_paths: Vec<String>,
    /// Empty means all methods are allowed.
    allow_methods: Vec<String>,
    /// Per-path override of the post-decrypt Content-Type.
    decrypt_content_type: HashMap<String, String>,
    tokens: Option<Tokens>,
    buffers: BufferPool,
}

impl Authenticator {
    pub fn new(kv: Arc<dyn KvStore>, signer_resolver: Arc<dyn SignerResolver>) -> Authenticator {
        Authenticator {
            headers: SignHeaders::default(),
            kv,
            signer_resolver,
            cryptor_resolver: None,
            crypt_paths: Vec::new(),
            crypt_exclude_paths: Vec::new(),
            auth_paths: Vec::new(),
            auth_exclude_paths: Vec::new(),
            allow_methods: Vec::new(),
            decrypt_content_type: HashMap::new(),
            tokens: None,
            buffers: BufferPool::new(64, 1024),
        }
    }

    /// Prefix for the signing headers, e.g. `pay` -> `x-pay-nonce`.
    pub fn with_biz_type(mut self, biz: &str) -> Self {
        self.headers = SignHeaders::for_biz_type(biz);
        self
    }

    pub fn with_cryptor_resolver(mut self, resolver: Arc<dyn CryptorResolver>) -> Self {
        self.cryptor_resolver = Some(resolver);
        self
    }

    pub fn with_crypt_paths(mut self, paths: Vec<String>, excludes: Vec<String>) -> Self {
        self.crypt_paths = paths;
        self.crypt_exclude_paths = excludes;
        self
    }

    pub fn with_auth_paths(mut self, paths: Vec<String>, excludes: Vec<String>) -> Self {
        self.auth_paths = paths;
        self.auth_exclude_paths = excludes;
        self
    }

    pub fn with_allow_methods(mut self, methods: Vec<String>) -> Self {
        self.allow_methods = methods;
        self
    }

    pub fn with_decrypt_content_type(mut self, map: HashMap<String, String>) -> Self {
        self.decrypt_content_type = map;
        self
    }

    pub fn with_jwt(mut self, issuer: &str, ttl: Duration, secret: &[u8]) -> Self {
        self.tokens = Some(Tokens::new(issuer, ttl, secret));
        self
    }

    pub fn sign_headers(&self) -> &SignHeaders {
        &self.headers
    }

    /// Issues a bearer token for the configured issuer and TTL.
    pub fn generate_token(
        &self,
        user_id: i64,
        role: &str,
        platform: &str,
    ) -> Result<String, AuthError> {
        let tokens = self.tokens.as_ref().ok_or(AuthError::JwtNotConfigured)?;
        Ok(tokens.generate(user_id, role, platform)?)
    }

    /// Adds a token to the revoked set. It stays revoked at least as long as
    /// the token's remaining TTL.
    pub async fn revoke_token(&self, token: &str) -> Result<(), AuthError> {
        Ok(self.kv.set_add(REVOKED_TOKENS_SET, token).await?)
    }

    pub async fn is_token_revoked(&self, token: &str) -> Result<bool, AuthError> {
        Ok(self.kv.set_contains(REVOKED_TOKENS_SET, token).await?)
    }

    async fn run(&self, req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
        // 1. Method allow-list.
        if !self.is_method_allowed(req.method()) {
            return Err(StatusCode::METHOD_NOT_ALLOWED);
        }

        let (mut parts, body) = req.into_parts();

        // 2. Signing headers. All mandatory; platform must parse.
        let nonce = required_header(&parts, &self.headers.nonce)?;
        let timestamp = required_header(&parts, &self.headers.timestamp)?;
        let signature = required_header(&parts, &self.headers.signature)?;
        let platform_raw = required_header(&parts, HEADER_PLATFORM)?;
        Platform::parse_header(&platform_raw).ok_or(StatusCode::BAD_REQUEST)?;

        // 3. Replay defense.
        self.check_replay(&nonce, &timestamp).await?;

        // 4. Capture the body; the request continues on a replayable copy.
        let body_bytes = to_bytes(body, usize::MAX)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let mut request_body = self.buffers.get();
        request_body.extend_from_slice(&body_bytes);
        drop(body_bytes);

        // 5 + 6. Canonical block and signature verification.
        let method = parts.method.clone();
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().unwrap_or("").to_string();

        let signer = self
            .signer_resolver
            .resolve(&parts)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let block = canonical_block(&SignFields {
            nonce: &nonce,
            timestamp: &timestamp,
            platform: &platform_raw,
            method: method.as_str(),
            path: &path,
            query: &query,
            body: &request_body,
        });
        if !signer.verify_base64(&block, &signature) {
            return Err(StatusCode::BAD_REQUEST);
        }

        // 7. Bearer token on auth paths; validate-if-present elsewhere.
        self.verify_token(&mut parts, &path).await?;

        // 8. Request decryption on encrypted paths.
        let encrypted_path = self.is_path_encrypted(&path);
        let cryptor = if encrypted_path {
            let resolver = self
                .cryptor_resolver
                .as_ref()
                .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
            Some(
                resolver
                    .resolve(&parts)
                    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
            )
        } else {
            None
        };

        if encrypted_path && !request_body.is_empty() {
            let content_type = parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !content_type.eq_ignore_ascii_case(CONTENT_TYPE_ENCRYPTED) {
                return Err(StatusCode::BAD_REQUEST);
            }
            let cryptor = cryptor.as_ref().ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
            let plaintext = cryptor
                .decrypt(&request_body)
                .map_err(|_| StatusCode::BAD_REQUEST)?;
            self.buffers.put(std::mem::replace(&mut request_body, plaintext));

            let rewritten = self.decrypt_content_type_for(&path);
            parts.headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(rewritten).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
            );
        }
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(request_body.len()));

        // 9 + 10. Run the handler against a buffered response.
        let req = Request::from_parts(parts, Body::from(request_body));
        let response = next.run(req).await;
        let (mut resp_parts, resp_body) = response.into_parts();
        let resp_bytes = to_bytes(resp_body, usize::MAX)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let mut response_body = self.buffers.get();
        response_body.extend_from_slice(&resp_bytes);
        drop(resp_bytes);

        // 11. Response encryption on encrypted paths.
        if encrypted_path {
            let cryptor = cryptor.as_ref().ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
            let ciphertext = cryptor
                .encrypt(&response_body)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            self.buffers.put(std::mem::replace(&mut response_body, ciphertext));
            resp_parts.headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(CONTENT_TYPE_ENCRYPTED),
            );
        }

        // 12. Response signing with a fresh nonce and millisecond timestamp.
        let resp_timestamp = Utc::now().timestamp_millis().to_string();
        let resp_nonce = Uuid::new_v4().simple().to_string();
        let resp_block = canonical_block(&SignFields {
            nonce: &resp_nonce,
            timestamp: &resp_timestamp,
            platform: &platform_raw,
            method: method.as_str(),
            path: &path,
            query: &query,
            body: &response_body,
        });
        let resp_signature = signer
            .sign_base64(&resp_block)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        set_header(&mut resp_parts.headers, &self.headers.timestamp, &resp_timestamp)?;
        set_header(&mut resp_parts.headers, &self.headers.nonce, &resp_nonce)?;
        set_header(&mut resp_parts.headers, &self.headers.signature, &resp_signature)?;
        resp_parts.headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_str(&self.headers.expose_value())
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
        );

        // 13. Buffered body out, with its true length.
        resp_parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(response_body.len()));
        Ok(Response::from_parts(resp_parts, Body::from(response_body)))
    }

    async fn check_replay(&self, nonce: &str, timestamp: &str) -> Result<(), StatusCode> {
        let ts: i64 = timestamp.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
        let now = Utc::now().timestamp();
        if (now - ts).abs() > REPLAY_WINDOW.as_secs() as i64 {
            return Err(StatusCode::BAD_REQUEST);
        }

        let first_use = self
            .kv
            .set_if_absent(&format!("{REPLAY_KEY_PREFIX}{nonce}"), "1", REPLAY_WINDOW)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        if !first_use {
            // Seen this nonce inside the window: replay.
            return Err(StatusCode::BAD_REQUEST);
        }
        Ok(())
    }

    async fn verify_token(&self, parts: &mut Parts, path: &str) -> Result<(), StatusCode> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .unwrap_or("");

        if self.is_path_auth_required(path) {
            if token.is_empty() {
                return Err(StatusCode::UNAUTHORIZED);
            }
            let revoked = self
                .is_token_revoked(token)
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            if revoked {
                return Err(StatusCode::UNAUTHORIZED);
            }
            let tokens = self.tokens.as_ref().ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
            let claims = tokens.parse(token).map_err(|_| StatusCode::UNAUTHORIZED)?;
            parts.extensions.insert(claims);
        } else if !token.is_empty() {
            // Auth-optional path: expose claims when the token happens to be
            // valid, stay silent otherwise.
            if matches!(self.is_token_revoked(token).await, Ok(false)) {
                if let Some(tokens) = &self.tokens {
                    if let Ok(claims) = tokens.parse(token) {
                        parts.extensions.insert(claims);
                    }
                }
            }
        }
        Ok(())
    }

    fn is_method_allowed(&self, method: &Method) -> bool {
        self.allow_methods.is_empty()
            || self
                .allow_methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    fn is_path_encrypted(&self, path: &str) -> bool {
        path_matches(path, &self.crypt_paths, &self.crypt_exclude_paths)
    }

    fn is_path_auth_required(&self, path: &str) -> bool {
        path_matches(path, &self.auth_paths, &self.auth_exclude_paths)
    }

    fn decrypt_content_type_for(&self, path: &str) -> &str {
        self.decrypt_content_type
            .iter()
            .find(|(p, _)| p.eq_ignore_ascii_case(path))
            .map(|(_, content_type)| content_type.as_str())
            .unwrap_or(CONTENT_TYPE_JSON)
    }
}

/// The middleware entry point:
///
/// ```ignore
/// let auth = Arc::new(Authenticator::new(kv, resolver).with_auth_paths(...));
/// let app = Router::new()
///     .route("/api/thing", post(handler))
///     .layer(middleware::from_fn_with_state(auth, authenticate));
/// ```
pub async fn authenticate(
    State(auth): State<Arc<Authenticator>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match auth.run(req, next).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

/// `*` in the include list matches every path; otherwise exact
/// case-insensitive comparison. Excludes win over includes.
fn path_matches(path: &str, includes: &[String], excludes: &[String]) -> bool {
    if excludes.iter().any(|p| p.eq_ignore_ascii_case(path)) {
        return false;
    }
    includes
        .iter()
        .any(|p| p.contains('*') || p.eq_ignore_ascii_case(path))
}

fn required_header(parts: &Parts, name: &str) -> Result<String, StatusCode> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(StatusCode::BAD_REQUEST)
}

fn set_header(
    headers: &mut axum::http::HeaderMap,
    name: &str,
    value: &str,
) -> Result<(), StatusCode> {
    let name = HeaderName::try_from(name).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let value = HeaderValue::from_str(value).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    headers.insert(name, value);
    Ok(())
}
