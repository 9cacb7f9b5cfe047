//! HTTP request authentication and secure envelopes.

pub mod canonical;
pub mod headers;
pub mod jwt;
pub mod pipeline;

use serde::{Deserialize, Serialize};

pub use canonical::{canonical_block, SignFields};
pub use headers::{SignHeaders, CONTENT_TYPE_ENCRYPTED, CONTENT_TYPE_JSON, HEADER_PLATFORM};
pub use jwt::{Claims, Tokens};
pub use pipeline::{
    authenticate, AuthError, Authenticator, CryptorResolver, FixedCryptorResolver,
    FixedSignerResolver, SignerResolver,
};

/// Standard application response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply<TCode, TData> {
    pub code: TCode,
    pub msg: String,
    pub data: TData,
}
