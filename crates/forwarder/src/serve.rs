use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, Scheme, ServerConfig, TlsFiles};
use crate::proxy::Proxy;

/// Extra drain budget granted on top of the read timeout before remaining
/// connections are abandoned.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum ServeError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("bind {addr}: {source}")]
	Bind {
		addr: String,
		#[source]
		source: io::Error,
	},
	#[error("tls setup: {0}")]
	Tls(String),
}

/// Binds the listener for the configured protocol, hands every accepted
/// connection to the engine, and drives graceful shutdown when the
/// cancellation token fires. Cancellation is not an error.
pub struct HttpServer {
	cfg: ServerConfig,
	proxy: Arc<Proxy>,
}

impl HttpServer {
	pub fn new(cfg: ServerConfig, proxy: Arc<Proxy>) -> Result<Self, ConfigError> {
		cfg.validate()?;
		Ok(Self { cfg, proxy })
	}

	pub async fn run(&self, cancel: CancellationToken) -> Result<(), ServeError> {
		if !self.proxy.transition_running() {
			debug!("proxy is already running");
			return Ok(());
		}

		let listener = TcpListener::bind(self.cfg.addr.as_str()).await.map_err(|source| {
			ServeError::Bind {
				addr: self.cfg.addr.clone(),
				source,
			}
		})?;
		let local_addr = listener.local_addr().map_err(|source| ServeError::Bind {
			addr: self.cfg.addr.clone(),
			source,
		})?;
		let tls = match (self.cfg.protocol, &self.cfg.tls) {
			(Scheme::Http, _) => None,
			(protocol, Some(files)) => Some(tls_acceptor(protocol, files)?),
			// validate() rules this out.
			(_, None) => None,
		};
		info!(addr = %local_addr, protocol = %self.cfg.protocol, "proxy listening");

		let grace = self.cfg.read_timeout + SHUTDOWN_BUDGET;
		let tracker = TaskTracker::new();
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				accepted = listener.accept() => {
					let (stream, remote) = match accepted {
						Ok(conn) => conn,
						Err(e) => {
							warn!(error = %e, "accept failed");
							continue;
						},
					};
					let conn = ConnTask {
						proxy: self.proxy.clone(),
						tls: tls.clone(),
						cancel: cancel.clone(),
						read_timeout: self.cfg.read_timeout,
						grace,
					};
					tracker.spawn(conn.serve(stream, remote));
				},
			}
		}

		// Stop accepting immediately, then drain in-flight connections for
		// the grace period. Each connection bounds its own drain, so the
		// tracker wait here is a backstop.
		drop(listener);
		tracker.close();
		info!("shutting down, draining connections");
		if tokio::time::timeout(grace + SHUTDOWN_BUDGET, tracker.wait()).await.is_err() {
			warn!("connections still open after drain budget, abandoning them");
		}
		Ok(())
	}
}

#[derive(Clone)]
struct ConnTask {
	proxy: Arc<Proxy>,
	tls: Option<TlsAcceptor>,
	cancel: CancellationToken,
	read_timeout: Duration,
	grace: Duration,
}

impl ConnTask {
	async fn serve(self, stream: TcpStream, remote: SocketAddr) {
		let _ = stream.set_nodelay(true);
		match &self.tls {
			None => self.serve_io(TokioIo::new(stream), remote).await,
			Some(acceptor) => match acceptor.accept(stream).await {
				Ok(tls_stream) => self.serve_io(TokioIo::new(tls_stream), remote).await,
				Err(e) => debug!(%remote, error = %e, "tls accept failed"),
			},
		}
	}

	async fn serve_io<I>(&self, io: TokioIo<I>, remote: SocketAddr)
	where
		I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
	{
		let proxy = self.proxy.clone();
		let service = service_fn(move |req| {
			let proxy = proxy.clone();
			async move { Ok::<_, std::convert::Infallible>(proxy.handle(req, remote).await) }
		});

		let mut builder = auto::Builder::new(TokioExecutor::new());
		builder
			.http1()
			.timer(TokioTimer::new())
			.header_read_timeout(self.read_timeout)
			.preserve_header_case(true);
		builder.http2().timer(TokioTimer::new());

		let conn = builder.serve_connection_with_upgrades(io, service);
		tokio::pin!(conn);
		tokio::select! {
			result = conn.as_mut() => {
				if let Err(e) = result {
					debug!(%remote, error = %e, "connection closed with error");
				}
			},
			_ = self.cancel.cancelled() => {
				// Live connections observe cancellation here: stop taking new
				// requests, give in-flight ones the grace period, then drop.
				conn.as_mut().graceful_shutdown();
				if tokio::time::timeout(self.grace, conn.as_mut()).await.is_err() {
					debug!(%remote, "connection did not drain in time, closing");
				}
			},
		}
	}
}

fn tls_acceptor(protocol: Scheme, files: &TlsFiles) -> Result<TlsAcceptor, ServeError> {
	let certs: Vec<CertificateDer<'static>> =
		CertificateDer::pem_file_iter(&files.cert_file)
			.map_err(|e| ServeError::Tls(format!("read {}: {e}", files.cert_file.display())))?
			.collect::<Result<_, _>>()
			.map_err(|e| ServeError::Tls(format!("parse {}: {e}", files.cert_file.display())))?;
	let key = PrivateKeyDer::from_pem_file(&files.key_file)
		.map_err(|e| ServeError::Tls(format!("read {}: {e}", files.key_file.display())))?;

	let mut config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.map_err(|e| ServeError::Tls(e.to_string()))?;
	config.alpn_protocols = match protocol {
		Scheme::H2 => vec![b"h2".to_vec()],
		_ => vec![b"http/1.1".to_vec()],
	};
	Ok(TlsAcceptor::from(Arc::new(config)))
}
