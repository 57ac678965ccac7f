use std::net::SocketAddr;

use http::{HeaderValue, Request, Response, StatusCode, header};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use super::{Proxy, ProxyError, trace};
use crate::Body;
use crate::client::{MaybeTlsStream, TunnelError, tunnel_handshake};
use crate::proxy::ProxyTrace;
use crate::util::empty_body;

enum Rejection {
	/// Upstream answered the CONNECT with a non-2xx; replay it verbatim.
	Response(Response<Body>),
	Error(ProxyError),
}

/// CONNECT pipeline: select the upstream, establish the far side, answer
/// `200`, then splice bytes both ways until either side closes. Setup
/// failures answer `502` and close.
pub(super) async fn handle(
	proxy: &Proxy,
	req: Request<Incoming>,
	remote: SocketAddr,
) -> Response<Body> {
	match establish(proxy, &req, remote).await {
		Ok((upstream, leftover)) => {
			let trace = proxy.trace.clone();
			tokio::spawn(tunnel(req, upstream, leftover, trace, remote));
			let mut resp = Response::new(empty_body());
			*resp.status_mut() = StatusCode::OK;
			resp
		},
		Err(Rejection::Response(resp)) => {
			debug!(%remote, status = resp.status().as_u16(), "upstream rejected tunnel");
			let err = ProxyError::UpstreamRejected(resp.status());
			trace::wrap(resp, &proxy.trace, Some(err.to_string()))
		},
		Err(Rejection::Error(err)) => {
			error!(%remote, error = %err, "connect failed");
			let mut resp = err.as_response();
			if err.status() != StatusCode::BAD_REQUEST {
				// All CONNECT setup failures surface as a bad gateway.
				*resp.status_mut() = StatusCode::BAD_GATEWAY;
			}
			resp
				.headers_mut()
				.insert(header::CONNECTION, HeaderValue::from_static("close"));
			trace::wrap(resp, &proxy.trace, Some(err.to_string()))
		},
	}
}

async fn establish(
	proxy: &Proxy,
	req: &Request<Incoming>,
	remote: SocketAddr,
) -> Result<(MaybeTlsStream, Vec<u8>), Rejection> {
	let authority = req.uri().authority().cloned().ok_or_else(|| {
		Rejection::Error(ProxyError::BadRequest("CONNECT target missing".to_string()))
	})?;
	let host = authority.host().to_ascii_lowercase();
	let port = authority.port_u16().unwrap_or(443);
	debug!(method = %req.method(), %remote, %host, port, "request");

	let via = proxy
		.router
		.select(&format!("https://{host}:{port}/"), &host)
		.await
		.map_err(Rejection::Error)?;

	match via {
		Some(via) => {
			let mut stream = proxy
				.client
				.dial_upstream(&via)
				.await
				.map_err(|e| Rejection::Error(ProxyError::from(e)))?;
			let dest = format!("{host}:{port}");
			match tunnel_handshake(&mut stream, &dest, via.auth.as_ref()).await {
				Ok(leftover) => Ok((stream, leftover)),
				Err(TunnelError::Rejected { response, .. }) => Err(Rejection::Response(*response)),
				Err(e) => Err(Rejection::Error(ProxyError::UpstreamDialFailed(Box::new(e)))),
			}
		},
		None => {
			let stream = proxy
				.client
				.dial_origin(&host, port)
				.await
				.map_err(|e| Rejection::Error(ProxyError::from(e)))?;
			Ok((stream, Vec::new()))
		},
	}
}

/// Runs after the 200 is written: waits for the connection upgrade, then
/// relays verbatim in both directions. EOF on one side propagates as a
/// write-side shutdown on the other. Splice failures are debug-level; the
/// trace fires once with the aggregated outcome.
async fn tunnel(
	req: Request<Incoming>,
	mut upstream: MaybeTlsStream,
	leftover: Vec<u8>,
	trace: ProxyTrace,
	remote: SocketAddr,
) {
	let upgraded = match hyper::upgrade::on(req).await {
		Ok(upgraded) => upgraded,
		Err(e) => {
			debug!(%remote, error = %e, "connect upgrade failed");
			trace.fire_wrote_response(StatusCode::OK, Some(format!("upgrade failed: {e}")));
			return;
		},
	};
	let mut client_io = TokioIo::new(upgraded);
	let result = async {
		if !leftover.is_empty() {
			client_io.write_all(&leftover).await?;
		}
		tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await
	}
	.await;
	match result {
		Ok((to_origin, to_client)) => {
			debug!(%remote, to_origin, to_client, "tunnel closed");
			trace.fire_wrote_response(StatusCode::OK, None);
		},
		Err(e) => {
			debug!(%remote, error = %e, "tunnel closed with error");
			trace.fire_wrote_response(StatusCode::OK, Some(e.to_string()));
		},
	}
}
