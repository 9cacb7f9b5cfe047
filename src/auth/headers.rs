//! Header names and media types for the signing scheme.
//!
//! The three signing headers are prefixed per business type so several
//! services can share a gateway without colliding: `x-<biz>-timestamp`,
//! `x-<biz>-nonce`, `x-<biz>-signature`. The platform header is fixed.

/// Decimal platform value, 1-9.
pub const HEADER_PLATFORM: &str = "x-platform";

/// Media type marking a body as AEAD ciphertext.
pub const CONTENT_TYPE_ENCRYPTED: &str = "application/octet-stream";

/// Default media type of a decrypted body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Business-type-prefixed signing header names, lowercase.
#[derive(Debug, Clone)]
pub struct SignHeaders {
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
}

impl SignHeaders {
    pub fn for_biz_type(biz: &str) -> SignHeaders {
        let biz = biz.trim().to_ascii_lowercase();
        SignHeaders {
            timestamp: format!("x-{biz}-timestamp"),
            nonce: format!("x-{biz}-nonce"),
            signature: format!("x-{biz}-signature"),
        }
    }

    /// Value for `Access-Control-Expose-Headers`; without it browsers cannot
    /// read the response signing headers.
    pub fn expose_value(&self) -> String {
        format!("{},{},{}", self.timestamp, self.nonce, self.signature)
    }
}

impl Default for SignHeaders {
    fn default() -> Self {
        SignHeaders::for_biz_type("niu")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn biz_prefix_shapes_the_names() {
        let headers = SignHeaders::for_biz_type("Pay");
        assert_eq!(headers.timestamp, "x-pay-timestamp");
        assert_eq!(headers.nonce, "x-pay-nonce");
        assert_eq!(headers.signature, "x-pay-signature");
    }

    #[test]
    fn default_prefix() {
        let headers = SignHeaders::default();
        assert_eq!(headers.nonce, "x-niu-nonce");
        assert_eq!(
            headers.expose_value(),
            "x-niu-timestamp,x-niu-nonce,x-niu-signature"
        );
    }
}
