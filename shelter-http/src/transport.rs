//! Wire transports behind [`crate::Transport`].
//!
//! - `ReqwestTransport`: pooled reqwest client, TLS capable.
//! - `RawTransport`: plain TCP HTTP/1.0 exchange parsed by
//!   [`crate::HttpResponse::parse`], for hosts where an HTTP client stack is
//!   unwanted or when traffic has to be inspected byte for byte.
mod client;
mod socket;

pub use client::ReqwestTransport;
pub use socket::RawTransport;
