mod client;
pub mod config;
pub mod creds;
pub mod dns;
pub mod pac;
pub mod proxy;
pub mod serve;
pub mod upstream;
mod util;

use bytes::Bytes;

pub use crate::config::{
	ConfigError, ForwardingConfig, Mode, ProxyAuthConfig, Scheme, ServerConfig, TransportConfig,
	UserInfo,
};
pub use crate::dns::{DnsConfig, Resolver};
pub use crate::pac::PacSource;
pub use crate::proxy::{Proxy, ProxyError, ProxyTrace, WroteResponse};
pub use crate::serve::{HttpServer, ServeError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response/request body used throughout the engine. Everything is streamed;
/// synthetic bodies are tiny single-chunk payloads.
pub type Body = http_body_util::combinators::BoxBody<Bytes, BoxError>;
