use http::HeaderValue;
use tracing::debug;
use url::Url;

use crate::pac::{Candidate, PacEvaluator};
use crate::proxy::ProxyError;
use crate::util::{basic_auth_value, is_localhost, redacted};

/// The effective upstream for a request: the proxy URL plus the
/// `Proxy-Authorization` value to emit on that hop when the URL carries
/// user info. Upstream credentials never reach the origin.
#[derive(Clone, Debug)]
pub struct Via {
	pub url: Url,
	pub auth: Option<HeaderValue>,
}

fn via_from_url(url: &Url) -> Result<Via, ProxyError> {
	match url.scheme() {
		"http" | "https" => {},
		other => {
			return Err(ProxyError::Selector(format!(
				"{other} upstream proxies are not supported"
			)));
		},
	}
	let auth = (!url.username().is_empty())
		.then(|| basic_auth_value(url.username(), url.password().unwrap_or_default()));
	Ok(Via {
		url: url.clone(),
		auth,
	})
}

enum Route {
	Direct,
	Upstream(Url),
	Pac(PacEvaluator),
}

/// Decides, per request, whether to dial the origin directly or go through
/// an upstream proxy. Read-only after construction; PAC evaluation is the
/// only suspension point.
pub struct Router {
	route: Route,
	proxy_localhost: bool,
}

impl Router {
	pub(crate) fn direct(proxy_localhost: bool) -> Self {
		Self {
			route: Route::Direct,
			proxy_localhost,
		}
	}

	pub(crate) fn upstream(url: Url, proxy_localhost: bool) -> Self {
		Self {
			route: Route::Upstream(url),
			proxy_localhost,
		}
	}

	pub(crate) fn pac(evaluator: PacEvaluator, proxy_localhost: bool) -> Self {
		Self {
			route: Route::Pac(evaluator),
			proxy_localhost,
		}
	}

	/// `target_url` is the full request URL handed to PAC; `host` the
	/// destination hostname used for the localhost gate.
	pub(crate) async fn select(
		&self,
		target_url: &str,
		host: &str,
	) -> Result<Option<Via>, ProxyError> {
		if !self.proxy_localhost && is_localhost(host) {
			debug!(host, "not proxying localhost request");
			return Ok(None);
		}
		match &self.route {
			Route::Direct => Ok(None),
			Route::Upstream(url) => Ok(Some(via_from_url(url)?)),
			Route::Pac(evaluator) => {
				let candidates = evaluator
					.find_proxy(target_url, host)
					.await
					.map_err(ProxyError::BadPac)?;
				// Only the first candidate is consulted; the rest are not
				// tried on failure.
				match candidates.into_iter().next() {
					None | Some(Candidate::Direct) => {
						debug!(host, "using no proxy");
						Ok(None)
					},
					Some(Candidate::Proxy(url)) => {
						debug!(host, upstream = %redacted(&url), "using proxy");
						Ok(Some(via_from_url(&url)?))
					},
				}
			},
		}
	}
}

#[cfg(test)]
#[path = "upstream_tests.rs"]
mod tests;
