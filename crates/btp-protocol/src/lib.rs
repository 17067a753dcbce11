//! BTP - Bitmunk Transfer Protocol.
//!
//! This crate implements:
//! - Signed request/response messages over HTTP/1.1
//! - Content signatures streamed inline or in a chunked trailer
//! - Public key resolution with a bounded LRU cache
//! - The client exchange with response-forgery checks
//! - Server-side actions, handlers and services
//! - REST dispatch by method and parameter count, with typed validators
//! - JSON, XML and form payload codecs with gzip/deflate

#![forbid(unsafe_code)]

// Wire
pub mod codec;
pub mod encoding;
pub mod http;
pub mod trailer;

// Messages and keys
pub mod keys;
pub mod message;

// Client and server sides
pub mod action;
pub mod client;
pub mod handler;
pub mod rest;
pub mod service;

// Supporting modules
pub mod errors;

pub use action::{Action, SERVER_NAME};
pub use client::{Client, ClientConfig, CLIENT_USER_AGENT};
pub use codec::ContentType;
pub use encoding::ContentEncoding;
pub use errors::{BreachKind, BtpError, ClientErrorKind, ErrorPayload, Result};
pub use handler::{
    authorize, handle_action, run_handler, ActionHandler, AuthPolicy, ResponderProfiles,
    SecurityContext,
};
pub use keys::{KeyCache, KeyResolver, ResolvedKey, StaticKeyResolver};
pub use message::{BtpMessage, HeaderValue, MessageKind, SecurityStatus, BTP_VERSION};
pub use rest::{validate_as, Params, RestResourceHandler, Route, Validator};
pub use service::{normalize_path, BtpService};
pub use trailer::SignedTrailer;

#[cfg(test)]
mod proptests;
