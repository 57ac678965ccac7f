mod auth;
mod connect;
mod error;
mod trace;

pub use error::{ProxyError, SetupError};
pub use trace::{ProxyTrace, WroteResponse, WroteResponseHook};

use std::net::SocketAddr;
use std::sync::Arc;

use http::uri::Authority;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, Uri, header};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use parking_lot::RwLock;
use tracing::{debug, error, info, trace as trace_log};

use crate::client::Client;
use crate::config::{ForwardingConfig, Mode, ProxyAuthConfig};
use crate::creds::SiteMatcher;
use crate::dns::Resolver;
use crate::pac::PacEvaluator;
use crate::upstream::Router;
use crate::util::{default_port, redacted};
use crate::{Body, BoxError};

/// Engine lifecycle. Transitions are one-way: Initializing → Setup in
/// `new`, Setup → Running when the server shell starts serving.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
	Initializing,
	Setup,
	Running,
}

/// The proxy engine: authenticates connections, dispatches plain HTTP vs
/// CONNECT, selects the upstream, injects site credentials, and forwards.
/// Immutable after construction apart from the lifecycle state.
pub struct Proxy {
	cfg: Arc<ForwardingConfig>,
	auth: Option<auth::ProxyAuth>,
	router: Router,
	creds: SiteMatcher,
	client: Client,
	trace: ProxyTrace,
	state: RwLock<State>,
}

impl Proxy {
	pub async fn new(
		cfg: ForwardingConfig,
		auth: Option<ProxyAuthConfig>,
		resolver: Resolver,
	) -> Result<Self, SetupError> {
		let state = RwLock::new(State::Initializing);
		cfg.validate()?;
		let creds = SiteMatcher::new(&cfg.site_credentials)?;
		let router = match (&cfg.upstream, &cfg.pac) {
			(Some(url), _) => {
				info!(upstream = %redacted(url), "upstream proxy configured");
				Router::upstream(url.clone(), cfg.proxy_localhost)
			},
			(None, Some(source)) => {
				info!(%source, "PAC configured");
				let evaluator = PacEvaluator::new(source, &cfg.pac_proxies_credentials).await?;
				Router::pac(evaluator, cfg.proxy_localhost)
			},
			(None, None) => Router::direct(cfg.proxy_localhost),
		};
		let client = Client::new(&cfg.transport, resolver);
		let auth = auth.map(auth::ProxyAuth::new);
		*state.write() = State::Setup;
		info!(mode = %cfg.mode(), "proxy engine ready");
		Ok(Self {
			cfg: Arc::new(cfg),
			auth,
			router,
			creds,
			client,
			trace: ProxyTrace::default(),
			state,
		})
	}

	pub fn with_trace(mut self, trace: ProxyTrace) -> Self {
		self.trace = trace;
		self
	}

	pub fn mode(&self) -> Mode {
		self.cfg.mode()
	}

	pub fn state(&self) -> State {
		*self.state.read()
	}

	/// Setup → Running. Returns false when the engine is already Running,
	/// in which case the caller must leave the running instance alone.
	pub(crate) fn transition_running(&self) -> bool {
		if *self.state.read() == State::Running {
			return false;
		}
		let mut state = self.state.write();
		if *state == State::Running {
			return false;
		}
		*state = State::Running;
		true
	}

	/// Per-request entry used by the server shell. Never fails; every error
	/// becomes a synthetic response, and the trace hook fires exactly once
	/// per request either way.
	pub async fn handle(&self, mut req: Request<Incoming>, remote: SocketAddr) -> Response<Body> {
		let is_connect = req.method() == Method::CONNECT;
		if let Some(auth) = &self.auth {
			if !auth.verify(req.headers()) {
				debug!(%remote, "proxy authentication failed");
				let mut resp = auth.challenge();
				if is_connect {
					resp
						.headers_mut()
						.insert(header::CONNECTION, HeaderValue::from_static("close"));
				}
				return trace::wrap(resp, &self.trace, Some(ProxyError::AuthFailed.to_string()));
			}
			// Never propagate the proxy-level credentials upstream.
			auth.strip(req.headers_mut());
		}

		if is_connect {
			connect::handle(self, req, remote).await
		} else {
			match self.forward(req, remote).await {
				Ok(resp) => trace::wrap(resp, &self.trace, None),
				Err(err) => {
					error!(%remote, error = %err, "request failed");
					debug!(%remote, error = ?err, "request failure detail");
					trace::wrap(err.as_response(), &self.trace, Some(err.to_string()))
				},
			}
		}
	}

	async fn forward(
		&self,
		req: Request<Incoming>,
		remote: SocketAddr,
	) -> Result<Response<Body>, ProxyError> {
		let mut req = req.map(|b| b.map_err(|e| Box::new(e) as BoxError).boxed());
		mark_sensitive(req.headers_mut());
		let (scheme, host, port) = normalize_uri(&mut req)?;
		debug!(method = %req.method(), %remote, %scheme, %host, port, "request");
		trace_log!(headers = ?req.headers(), "request headers");

		let target_url = req.uri().to_string();
		let via = self.router.select(&target_url, &host).await?;

		strip_hop_headers(req.headers_mut());

		if let Some(value) = self.creds.matching(&host, port) {
			// An existing Authorization header is overwritten only when a
			// site credential matches.
			req.headers_mut().insert(header::AUTHORIZATION, value.clone());
		}
		if let Some(via) = &via {
			debug!(upstream = %redacted(&via.url), %host, "forwarding via upstream proxy");
			if let Some(auth) = &via.auth {
				req
					.headers_mut()
					.insert(header::PROXY_AUTHORIZATION, auth.clone());
			}
		}

		let resp = self.client.call(req, via.as_ref()).await?;
		debug!(%remote, %host, status = resp.status().as_u16(), "response");
		Ok(resp.map(|b| b.map_err(|e| Box::new(e) as BoxError).boxed()))
	}
}

impl std::fmt::Debug for Proxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Proxy")
			.field("mode", &self.cfg.mode())
			.field("state", &self.state())
			.finish()
	}
}

// Hop-by-hop headers, removed in one pass before forwarding. RFC 7230
// requires hop-by-hop headers to be listed in Connection; the static set
// covers the RFC 2616 names still sent by older clients.
static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

fn strip_hop_headers(headers: &mut HeaderMap) {
	let listed: Vec<HeaderName> = headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
		.collect();
	for name in listed {
		headers.remove(&name);
	}
	for name in &HOP_HEADERS {
		headers.remove(name);
	}
}

fn mark_sensitive(headers: &mut HeaderMap) {
	for (name, value) in headers.iter_mut() {
		if name == header::AUTHORIZATION || name == header::PROXY_AUTHORIZATION {
			value.set_sensitive(true);
		}
	}
}

/// Proxy clients send absolute-form request targets; origin-form requests
/// fall back to the Host header. After this the URI always has scheme,
/// authority and path, and the Host header is left for hyper to re-derive.
fn normalize_uri(req: &mut Request<Body>) -> Result<(String, String, u16), ProxyError> {
	if req.uri().authority().is_none() {
		let host = req
			.headers()
			.get(header::HOST)
			.and_then(|h| h.to_str().ok())
			.and_then(|h| h.parse::<Authority>().ok())
			.ok_or_else(|| {
				ProxyError::BadRequest("request target is not absolute and has no Host header".to_string())
			})?;
		let mut parts = std::mem::take(req.uri_mut()).into_parts();
		parts.authority = Some(host);
		if parts.scheme.is_none() {
			parts.scheme = Some(http::uri::Scheme::HTTP);
		}
		if parts.path_and_query.is_none() {
			parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
		}
		*req.uri_mut() =
			Uri::from_parts(parts).map_err(|e| ProxyError::BadRequest(e.to_string()))?;
	}
	req.headers_mut().remove(header::HOST);

	let uri = req.uri();
	let scheme = uri.scheme_str().unwrap_or("http").to_string();
	let host = uri.host().unwrap_or_default().to_ascii_lowercase();
	if host.is_empty() {
		return Err(ProxyError::BadRequest("request has no host".to_string()));
	}
	let port = uri.port_u16().or_else(|| default_port(&scheme)).unwrap_or(80);
	Ok((scheme, host, port))
}
