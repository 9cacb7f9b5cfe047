//! Lariat: a toolkit for authenticated, encrypted, real-time client/server
//! systems.
//!
//! Three subsystems share one trust model:
//!
//! - [`hub`] — a WebSocket connection hub multiplexing per-user/per-platform
//!   sessions over a bounded worker pool;
//! - [`auth`] — an HTTP middleware pipeline for replay defense, request and
//!   response signing, payload encryption and JWT bearer validation;
//! - [`frame`] — a binary framed packet protocol for WebSocket payloads,
//!   parameterized by codec, signer and cryptor.
//!
//! The supporting pieces — [`crypto`] signers and cryptors, [`codec`]
//! strategies, the [`pool`] worker pool, the [`kv`] store façade and the
//! [`buffer`] pool — stand on their own as well.

pub mod auth;
pub mod buffer;
pub mod codec;
pub mod crypto;
pub mod frame;
pub mod hub;
pub mod kv;
pub mod platform;
pub mod pool;
