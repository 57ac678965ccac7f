use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use super::DialError;

/// Client-side TLS (https upstream proxies and https origins on the plain
/// pipeline), verified against the system trust store.
pub(super) fn client_config() -> Arc<rustls::ClientConfig> {
	let mut roots = rustls::RootCertStore::empty();
	let native = rustls_native_certs::load_native_certs();
	for error in &native.errors {
		debug!(%error, "skipping unreadable system root certificate");
	}
	for cert in native.certs {
		let _ = roots.add(cert);
	}
	let config = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	Arc::new(config)
}

pub(super) async fn handshake(
	config: Arc<rustls::ClientConfig>,
	host: &str,
	stream: TcpStream,
	timeout: Duration,
) -> Result<TlsStream<TcpStream>, DialError> {
	let name = ServerName::try_from(host.to_string())
		.map_err(|_| DialError::InvalidTarget(format!("not a valid TLS server name: {host}")))?;
	let connector = TlsConnector::from(config);
	match tokio::time::timeout(timeout, connector.connect(name, stream)).await {
		Ok(Ok(stream)) => Ok(stream),
		Ok(Err(e)) => Err(DialError::Tls(e)),
		Err(_) => Err(DialError::TlsTimeout),
	}
}
