use http::{Response, StatusCode, header};

use crate::client::DialError;
use crate::config::ConfigError;
use crate::dns::ResolveError;
use crate::pac::PacError;
use crate::util::full_body;
use crate::{Body, BoxError};

/// Construction-time failure: bad configuration or an unloadable PAC
/// script. Never surfaced mid-flight.
#[derive(thiserror::Error, Debug)]
pub enum SetupError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("pac: {0}")]
	Pac(#[from] PacError),
}

/// Per-request failure. Converted to an HTTP response at the engine
/// boundary; the body is a single line derived from the kind and never
/// names the upstream or carries credentials.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("proxy authentication required")]
	AuthFailed,
	#[error("malformed request: {0}")]
	BadRequest(String),
	#[error("all DNS servers failed")]
	ResolverExhausted,
	#[error("failed to reach the destination")]
	UpstreamDialFailed(#[source] BoxError),
	#[error("upstream proxy rejected the connection")]
	UpstreamRejected(StatusCode),
	#[error("PAC evaluation failed")]
	BadPac(#[source] PacError),
	#[error("upstream selection failed: {0}")]
	Selector(String),
	#[error("upstream request failed")]
	UpstreamCallFailed(#[source] BoxError),
	#[error("request cancelled")]
	Cancelled,
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::AuthFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
			ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
			ProxyError::Selector(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::ResolverExhausted
			| ProxyError::UpstreamDialFailed(_)
			| ProxyError::UpstreamRejected(_)
			| ProxyError::BadPac(_)
			| ProxyError::UpstreamCallFailed(_)
			| ProxyError::Cancelled => StatusCode::BAD_GATEWAY,
		}
	}

	pub fn as_response(&self) -> Response<Body> {
		let mut resp = Response::new(full_body(format!("{self}\n")));
		*resp.status_mut() = self.status();
		resp.headers_mut().insert(
			header::CONTENT_TYPE,
			header::HeaderValue::from_static("text/plain; charset=utf-8"),
		);
		resp
	}
}

impl From<DialError> for ProxyError {
	fn from(err: DialError) -> Self {
		match err {
			DialError::Resolve(ResolveError::Exhausted(_)) => ProxyError::ResolverExhausted,
			other => ProxyError::UpstreamDialFailed(Box::new(other)),
		}
	}
}
