//! Binary framed packets for WebSocket payloads.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! Request:  [msg_type:u8][request_id:u32][timestamp:u32][body...][signature?]
//! Response: [msg_type:u8][request_id:u32][timestamp:u32][code:u8][body...][signature?]
//! ```
//!
//! `timestamp` counts whole seconds since 2025-01-01T00:00:00 local time.
//! The body is the codec-encoded payload, encrypted when a cryptor is
//! configured. The signature, when a signer is configured, covers the header
//! and the (possibly encrypted) body and is appended last; its length is a
//! fixed property of the signer. Verification happens before decryption:
//! unauthenticated ciphertext is never decrypted.

use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::codec::{Codec, CodecError, JsonCodec, MsgPackCodec};
use crate::crypto::{CryptError, Cryptor, SignError, Signer};

/// Request header: msg_type + request_id + timestamp.
pub const REQUEST_HEADER_LEN: usize = 9;

/// Response header: the request form plus one status code byte.
pub const RESPONSE_HEADER_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, need at least {need}")]
    TooShort { len: usize, need: usize },

    #[error("signature section missing")]
    SignatureMissing,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("sign failed: {0}")]
    Sign(#[from] SignError),

    #[error(transparent)]
    Crypt(#[from] CryptError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Parsed request header. `request_id` is caller-chosen and echoed back in
/// the matching response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub msg_type: u8,
    pub request_id: u32,
    pub timestamp: u32,
}

impl RequestHeader {
    /// Reads the header without touching body, signature or ciphertext —
    /// cheap dispatch before a full decode.
    pub fn parse(data: &[u8]) -> Result<RequestHeader, FrameError> {
        if data.len() < REQUEST_HEADER_LEN {
            return Err(FrameError::TooShort { len: data.len(), need: REQUEST_HEADER_LEN });
        }
        Ok(RequestHeader {
            msg_type: data[0],
            request_id: be_u32(&data[1..5]),
            timestamp: be_u32(&data[5..9]),
        })
    }

    /// The header timestamp as wall-clock time.
    pub fn timestamp_local(&self) -> DateTime<Local> {
        protocol_epoch() + chrono::Duration::seconds(i64::from(self.timestamp))
    }
}

/// Parsed response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub msg_type: u8,
    pub request_id: u32,
    pub timestamp: u32,
    pub code: u8,
}

impl ResponseHeader {
    pub fn parse(data: &[u8]) -> Result<ResponseHeader, FrameError> {
        if data.len() < RESPONSE_HEADER_LEN {
            return Err(FrameError::TooShort { len: data.len(), need: RESPONSE_HEADER_LEN });
        }
        Ok(ResponseHeader {
            msg_type: data[0],
            request_id: be_u32(&data[1..5]),
            timestamp: be_u32(&data[5..9]),
            code: data[9],
        })
    }
}

/// Framed packet protocol, parameterized by codec and optionally armed with
/// a signer and a cryptor. Request and response packets differ only by the
/// one-byte code suffix on the header, so a single sealing/opening path
/// serves both.
pub struct Protocol<C: Codec> {
    signer: Option<Arc<dyn Signer>>,
    cryptor: Option<Arc<dyn Cryptor>>,
    codec: C,
}

impl Protocol<JsonCodec> {
    pub fn json(signer: Option<Arc<dyn Signer>>, cryptor: Option<Arc<dyn Cryptor>>) -> Self {
        Protocol::new(JsonCodec, signer, cryptor)
    }
}

impl Protocol<MsgPackCodec> {
    pub fn msgpack(signer: Option<Arc<dyn Signer>>, cryptor: Option<Arc<dyn Cryptor>>) -> Self {
        Protocol::new(MsgPackCodec, signer, cryptor)
    }
}

impl<C: Codec> Protocol<C> {
    pub fn new(
        codec: C,
        signer: Option<Arc<dyn Signer>>,
        cryptor: Option<Arc<dyn Cryptor>>,
    ) -> Self {
        Protocol { signer, cryptor, codec }
    }

    pub fn encode_request<T: Serialize>(
        &self,
        msg_type: u8,
        request_id: u32,
        payload: Option<&T>,
    ) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(REQUEST_HEADER_LEN + 64);
        out.push(msg_type);
        out.extend_from_slice(&request_id.to_be_bytes());
        out.extend_from_slice(&seconds_since_epoch().to_be_bytes());
        self.seal(out, payload)
    }

    pub fn encode_response<T: Serialize>(
        &self,
        msg_type: u8,
        request_id: u32,
        code: u8,
        payload: Option<&T>,
    ) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(RESPONSE_HEADER_LEN + 64);
        out.push(msg_type);
        out.extend_from_slice(&request_id.to_be_bytes());
        out.extend_from_slice(&seconds_since_epoch().to_be_bytes());
        out.push(code);
        self.seal(out, payload)
    }

    pub fn decode_request<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<(RequestHeader, Option<T>), FrameError> {
        let body = self.open(data, REQUEST_HEADER_LEN)?;
        let header = RequestHeader::parse(data)?;
        let payload = match body {
            Some(bytes) => Some(self.codec.decode(&bytes)?),
            None => None,
        };
        Ok((header, payload))
    }

    pub fn decode_response<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<(ResponseHeader, Option<T>), FrameError> {
        let body = self.open(data, RESPONSE_HEADER_LEN)?;
        let header = ResponseHeader::parse(data)?;
        let payload = match body {
            Some(bytes) => Some(self.codec.decode(&bytes)?),
            None => None,
        };
        Ok((header, payload))
    }

    /// Appends the (possibly encrypted) body and the trailing signature.
    /// The signature covers header and body exactly as they sit on the wire.
    fn seal<T: Serialize>(
        &self,
        mut out: Vec<u8>,
        payload: Option<&T>,
    ) -> Result<Vec<u8>, FrameError> {
        let mut body = match payload {
            Some(value) => self.codec.encode(value)?,
            None => Vec::new(),
        };
        if !body.is_empty() {
            if let Some(cryptor) = &self.cryptor {
                body = cryptor.encrypt(&body)?;
            }
        }
        out.extend_from_slice(&body);

        if let Some(signer) = &self.signer {
            let signature = signer.sign(&out)?;
            out.extend_from_slice(&signature);
        }
        Ok(out)
    }

    /// Verifies, strips and decrypts down to the plaintext body bytes.
    /// `None` means the packet legitimately carries no payload.
    fn open(&self, data: &[u8], header_len: usize) -> Result<Option<Vec<u8>>, FrameError> {
        if data.len() < header_len {
            return Err(FrameError::TooShort { len: data.len(), need: header_len });
        }

        let body_end = match &self.signer {
            Some(signer) => {
                let sig_start = data
                    .len()
                    .checked_sub(signer.signature_len())
                    .filter(|start| *start >= header_len)
                    .ok_or(FrameError::SignatureMissing)?;
                if !signer.verify(&data[..sig_start], &data[sig_start..]) {
                    return Err(FrameError::SignatureMismatch);
                }
                sig_start
            }
            None => data.len(),
        };

        let body = &data[header_len..body_end];
        if body.is_empty() {
            return Ok(None);
        }
        match &self.cryptor {
            Some(cryptor) => Ok(Some(cryptor.decrypt(body)?)),
            None => Ok(Some(body.to_vec())),
        }
    }
}

/// Seconds elapsed since the protocol epoch, 2025-01-01T00:00:00 local.
fn seconds_since_epoch() -> u32 {
    let elapsed = Local::now().signed_duration_since(protocol_epoch());
    elapsed.num_seconds().max(0) as u32
}

fn protocol_epoch() -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .earliest()
        .expect("2025-01-01 00:00:00 exists in every timezone")
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
