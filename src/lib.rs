//! A multi-site HTTP reverse proxy.
//!
//! One listening process accepts inbound requests, classifies each against
//! an ordered list of site rules, selects a backend from a
//! dynamically-resolved pool, rewrites the request, and either forwards it
//! (streaming the response body back) or replies with a redirect.

pub mod config;
pub mod director;
pub mod error;
pub mod matcher;
pub mod proxy;
pub mod upstream;

pub use config::Config;
pub use proxy::Server;
