use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode, header};
use subtle::ConstantTimeEq;

use crate::Body;
use crate::config::ProxyAuthConfig;
use crate::util::full_body;

/// Proxy-level basic auth. Every incoming request must present matching
/// credentials in the configured header (normally `Proxy-Authorization`).
pub(crate) struct ProxyAuth {
	username: String,
	password: String,
	header: HeaderName,
}

impl ProxyAuth {
	pub(crate) fn new(cfg: ProxyAuthConfig) -> Self {
		Self {
			username: cfg.credentials.username().to_string(),
			password: cfg.credentials.password().to_string(),
			header: cfg.header,
		}
	}

	/// Username and password are compared in constant time regardless of
	/// where they first differ.
	pub(crate) fn verify(&self, headers: &HeaderMap) -> bool {
		let Some(value) = headers.get(&self.header) else {
			return false;
		};
		let Ok(value) = value.to_str() else {
			return false;
		};
		let Some(encoded) = strip_basic_scheme(value) else {
			return false;
		};
		let Ok(decoded) = BASE64.decode(encoded.trim()) else {
			return false;
		};
		let Ok(decoded) = String::from_utf8(decoded) else {
			return false;
		};
		let Some((username, password)) = decoded.split_once(':') else {
			return false;
		};
		let user_ok = username.as_bytes().ct_eq(self.username.as_bytes());
		let pass_ok = password.as_bytes().ct_eq(self.password.as_bytes());
		bool::from(user_ok & pass_ok)
	}

	/// Drops the credential header so it is never forwarded.
	pub(crate) fn strip(&self, headers: &mut HeaderMap) {
		headers.remove(&self.header);
	}

	pub(crate) fn challenge(&self) -> Response<Body> {
		let mut resp = Response::new(full_body("proxy authentication required\n"));
		*resp.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
		resp.headers_mut().insert(
			header::PROXY_AUTHENTICATE,
			HeaderValue::from_static("Basic realm=\"forwarder\""),
		);
		resp
	}
}

fn strip_basic_scheme(value: &str) -> Option<&str> {
	let (scheme, rest) = value.split_once(' ')?;
	scheme.eq_ignore_ascii_case("Basic").then_some(rest)
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
