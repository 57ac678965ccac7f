mod connect_tunnel;
mod tls;

pub(crate) use connect_tunnel::{TunnelError, handshake as tunnel_handshake};

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use http::Uri;
use hyper::body::Incoming;
use hyper::rt::{Read as _, Write as _};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use url::Url;

use crate::config::TransportConfig;
use crate::dns::{ResolveError, Resolver};
use crate::proxy::ProxyError;
use crate::upstream::Via;
use crate::util::default_port;
use crate::{Body, BoxError};

#[derive(thiserror::Error, Debug)]
pub(crate) enum DialError {
	#[error("resolve: {0}")]
	Resolve(#[from] ResolveError),
	#[error("dial timeout")]
	Timeout,
	#[error("connect: {0}")]
	Connect(#[source] io::Error),
	#[error("tls handshake timeout")]
	TlsTimeout,
	#[error("tls handshake: {0}")]
	Tls(#[source] io::Error),
	#[error("invalid dial target: {0}")]
	InvalidTarget(String),
}

/// An established outbound connection, TLS or not, carrying its per-host
/// permit so the cap is released when the connection is dropped.
pub(crate) struct Socket {
	inner: TokioIo<MaybeTlsStream>,
	_permit: Option<OwnedSemaphorePermit>,
	proxied: bool,
}

pub(crate) enum MaybeTlsStream {
	Plain(TcpStream),
	Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.get_mut() {
			MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
			MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for MaybeTlsStream {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
			MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
			MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
			MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}

impl hyper::rt::Read for Socket {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: hyper::rt::ReadBufCursor<'_>,
	) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl hyper::rt::Write for Socket {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}

impl Connection for Socket {
	fn connected(&self) -> Connected {
		let connected = Connected::new();
		if self.proxied {
			// Keeps the request line in absolute form on this connection.
			connected.proxy(true)
		} else {
			connected
		}
	}
}

/// Where a connector dials: the fixed upstream proxy, or (when `None` on
/// the connector) whatever host the request URI names.
#[derive(Clone, Debug)]
struct ProxyTarget {
	host: String,
	port: u16,
	tls: bool,
}

impl TryFrom<&Url> for ProxyTarget {
	type Error = DialError;

	fn try_from(url: &Url) -> Result<Self, DialError> {
		let host = url
			.host_str()
			.ok_or_else(|| DialError::InvalidTarget("upstream URL has no host".to_string()))?
			.to_string();
		let port = url
			.port_or_known_default()
			.ok_or_else(|| DialError::InvalidTarget("upstream URL has no port".to_string()))?;
		Ok(Self {
			host,
			port,
			tls: url.scheme() == "https",
		})
	}
}

/// Per-host connection cap. Permits live inside the `Socket`, so a pooled
/// or tunneled connection counts until it is actually closed.
struct HostLimiter {
	max: usize,
	semaphores: Mutex<HashMap<(String, u16), Arc<Semaphore>>>,
}

impl HostLimiter {
	fn new(max: usize) -> Self {
		Self {
			max,
			semaphores: Mutex::new(HashMap::new()),
		}
	}

	async fn acquire(&self, host: &str, port: u16) -> Option<OwnedSemaphorePermit> {
		if self.max == 0 {
			return None;
		}
		let semaphore = {
			let mut map = self.semaphores.lock();
			map
				.entry((host.to_string(), port))
				.or_insert_with(|| Arc::new(Semaphore::new(self.max)))
				.clone()
		};
		// The semaphore is never closed.
		semaphore.acquire_owned().await.ok()
	}
}

#[derive(Clone)]
struct Connector {
	cfg: Arc<TransportConfig>,
	resolver: Resolver,
	tls: Arc<rustls::ClientConfig>,
	limiter: Arc<HostLimiter>,
	proxy: Option<ProxyTarget>,
}

impl Connector {
	async fn connect(&self, dst: Uri) -> Result<Socket, DialError> {
		let start = Instant::now();
		let (host, port, use_tls, proxied) = match &self.proxy {
			Some(p) => (p.host.clone(), p.port, p.tls, true),
			None => {
				let host = dst
					.host()
					.ok_or_else(|| DialError::InvalidTarget("request URI has no host".to_string()))?
					.to_string();
				let scheme = dst.scheme_str().unwrap_or("http");
				let port = dst
					.port_u16()
					.or_else(|| default_port(scheme))
					.ok_or_else(|| DialError::InvalidTarget(format!("no port for scheme {scheme}")))?;
				(host, port, scheme == "https", false)
			},
		};

		let permit = self.limiter.acquire(&host, port).await;
		let stream = self.dial_tcp(&host, port).await?;
		let stream = if use_tls {
			MaybeTlsStream::Tls(Box::new(
				tls::handshake(self.tls.clone(), &host, stream, self.cfg.tls_handshake_timeout)
					.await?,
			))
		} else {
			MaybeTlsStream::Plain(stream)
		};

		debug!(
			endpoint = %format_args!("{host}:{port}"),
			tls = use_tls,
			proxied,
			connect_ms = start.elapsed().as_millis() as u64,
			"connected"
		);
		Ok(Socket {
			inner: TokioIo::new(stream),
			_permit: permit,
			proxied,
		})
	}

	async fn dial_tcp(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
		let addrs = self.resolver.lookup(host, port).await?;
		let stream = tokio::time::timeout(self.cfg.dial_timeout, try_connect(addrs))
			.await
			.map_err(|_| DialError::Timeout)??;
		stream.set_nodelay(true).map_err(DialError::Connect)?;
		if !self.cfg.keep_alive.is_zero() {
			let keepalive = socket2::TcpKeepalive::new()
				.with_time(self.cfg.keep_alive)
				.with_interval(self.cfg.keep_alive);
			socket2::SockRef::from(&stream)
				.set_tcp_keepalive(&keepalive)
				.map_err(DialError::Connect)?;
		}
		Ok(stream)
	}
}

async fn try_connect(addrs: Vec<SocketAddr>) -> Result<TcpStream, DialError> {
	let mut last = None;
	for addr in addrs {
		match TcpStream::connect(addr).await {
			Ok(stream) => return Ok(stream),
			Err(e) => {
				debug!(%addr, error = %e, "connect attempt failed");
				last = Some(e);
			},
		}
	}
	Err(DialError::Connect(last.unwrap_or_else(|| {
		io::Error::new(io::ErrorKind::NotFound, "no addresses to dial")
	})))
}

impl tower_service::Service<Uri> for Connector {
	type Response = Socket;
	type Error = BoxError;
	type Future = Pin<Box<dyn Future<Output = Result<Socket, BoxError>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, dst: Uri) -> Self::Future {
		let connector = self.clone();
		Box::pin(async move { connector.connect(dst).await.map_err(|e| Box::new(e) as BoxError) })
	}
}

type PoolClient = hyper_util::client::legacy::Client<Connector, Body>;

/// Outbound transport: a pooled client for direct traffic plus one pooled
/// client per distinct upstream proxy, so direct and proxied connections to
/// the same origin never share a pool.
pub(crate) struct Client {
	cfg: Arc<TransportConfig>,
	resolver: Resolver,
	tls: Arc<rustls::ClientConfig>,
	limiter: Arc<HostLimiter>,
	direct: PoolClient,
	via_pools: Mutex<HashMap<Url, PoolClient>>,
}

impl Client {
	pub(crate) fn new(cfg: &TransportConfig, resolver: Resolver) -> Self {
		let cfg = Arc::new(cfg.clone());
		let tls = tls::client_config();
		let limiter = Arc::new(HostLimiter::new(cfg.max_conns_per_host));
		let direct = build_pool(
			&cfg,
			Connector {
				cfg: cfg.clone(),
				resolver: resolver.clone(),
				tls: tls.clone(),
				limiter: limiter.clone(),
				proxy: None,
			},
		);
		Self {
			cfg,
			resolver,
			tls,
			limiter,
			direct,
			via_pools: Mutex::new(HashMap::new()),
		}
	}

	pub(crate) async fn call(
		&self,
		req: http::Request<Body>,
		via: Option<&Via>,
	) -> Result<http::Response<Incoming>, ProxyError> {
		let pool = match via {
			None => self.direct.clone(),
			Some(via) => self.via_pool(via)?,
		};
		let call = pool.request(req);
		let result = if self.cfg.response_header_timeout.is_zero() {
			call.await
		} else {
			match tokio::time::timeout(self.cfg.response_header_timeout, call).await {
				Ok(result) => result,
				Err(_) => {
					return Err(ProxyError::UpstreamCallFailed(
						"timed out waiting for response headers".into(),
					));
				},
			}
		};
		result.map_err(classify_call_error)
	}

	fn via_pool(&self, via: &Via) -> Result<PoolClient, ProxyError> {
		let target = ProxyTarget::try_from(&via.url).map_err(ProxyError::from)?;
		let mut pools = self.via_pools.lock();
		if let Some(pool) = pools.get(&via.url) {
			return Ok(pool.clone());
		}
		let pool = build_pool(
			&self.cfg,
			Connector {
				cfg: self.cfg.clone(),
				resolver: self.resolver.clone(),
				tls: self.tls.clone(),
				limiter: self.limiter.clone(),
				proxy: Some(target),
			},
		);
		pools.insert(via.url.clone(), pool.clone());
		Ok(pool)
	}

	fn raw_connector(&self) -> Connector {
		Connector {
			cfg: self.cfg.clone(),
			resolver: self.resolver.clone(),
			tls: self.tls.clone(),
			limiter: self.limiter.clone(),
			proxy: None,
		}
	}

	/// Opens a raw TCP connection to the origin for a CONNECT tunnel. The
	/// tunneled bytes are opaque, so no TLS is applied here.
	pub(crate) async fn dial_origin(
		&self,
		host: &str,
		port: u16,
	) -> Result<MaybeTlsStream, DialError> {
		let stream = self.raw_connector().dial_tcp(host, port).await?;
		Ok(MaybeTlsStream::Plain(stream))
	}

	/// Opens a connection to an upstream proxy for a CONNECT tunnel, with
	/// TLS when the upstream itself is https.
	pub(crate) async fn dial_upstream(&self, via: &Via) -> Result<MaybeTlsStream, DialError> {
		let target = ProxyTarget::try_from(&via.url)?;
		let stream = self.raw_connector().dial_tcp(&target.host, target.port).await?;
		if target.tls {
			let stream =
				tls::handshake(self.tls.clone(), &target.host, stream, self.cfg.tls_handshake_timeout)
					.await?;
			Ok(MaybeTlsStream::Tls(Box::new(stream)))
		} else {
			Ok(MaybeTlsStream::Plain(stream))
		}
	}
}

impl std::fmt::Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").finish()
	}
}

fn build_pool(cfg: &TransportConfig, connector: Connector) -> PoolClient {
	let mut builder = hyper_util::client::legacy::Client::builder(TokioExecutor::new());
	builder.timer(TokioTimer::new());
	builder.pool_timer(TokioTimer::new());
	// 0 means "no idle timeout", matching the transport knob semantics.
	if !cfg.idle_conn_timeout.is_zero() {
		builder.pool_idle_timeout(cfg.idle_conn_timeout);
	}
	builder.pool_max_idle_per_host(cfg.max_idle_conns_per_host);
	builder.build(connector)
}

fn classify_call_error(err: hyper_util::client::legacy::Error) -> ProxyError {
	enum Kind {
		Resolver,
		Dial,
		Other,
	}
	let mut kind = if err.is_connect() { Kind::Dial } else { Kind::Other };
	let mut source = std::error::Error::source(&err);
	while let Some(e) = source {
		if let Some(dial) = e.downcast_ref::<DialError>() {
			kind = match dial {
				DialError::Resolve(ResolveError::Exhausted(_)) => Kind::Resolver,
				_ => Kind::Dial,
			};
			break;
		}
		source = e.source();
	}
	match kind {
		Kind::Resolver => ProxyError::ResolverExhausted,
		Kind::Dial => ProxyError::UpstreamDialFailed(Box::new(err)),
		Kind::Other => ProxyError::UpstreamCallFailed(Box::new(err)),
	}
}
