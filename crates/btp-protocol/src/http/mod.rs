//! Minimal HTTP/1.1 layer BTP messages are framed with.

pub mod connection;
pub mod header;
pub mod throttle;

pub use connection::{BodyFraming, BodyReader, HttpConnection, IoStream, DEFAULT_IO_TIMEOUT};
pub use header::{names, reason_phrase, HeaderFields, HttpHeader, HttpVersion};
pub use throttle::BandwidthThrottler;
