//! HTTP plumbing for shelter: the response model, form encoding and the
//! origin client.
//!
//! The origin client talks to one fixed host. [`HttpOrigin`] wraps a
//! [`Transport`] (reqwest based or raw socket) and adds manual redirect
//! handling on top; the proxy only ever sees the [`OriginClient`] trait.
mod error;
pub mod form;
mod headers;
mod origin;
mod response;
pub mod transport;

pub use error::{OriginError, ParseError};
pub use form::{FormFields, FormValue, PostFile, PostFiles};
pub use headers::Headers;
pub use origin::{HttpOrigin, OriginClient, OriginRequest, Transport};
pub use response::{
    CONTENT_MARKER_HEADER, CacheAnnotations, HttpResponse, NOTIFICATION_HEADER,
    Notification,
};
pub use transport::{RawTransport, ReqwestTransport};
