use http::{HeaderName, HeaderValue, Response, StatusCode, header};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Body;
use crate::util::full_body;

const MAX_RESPONSE_HEAD: usize = 8192;

#[derive(thiserror::Error, Debug)]
pub(crate) enum TunnelError {
	#[error("tunnel handshake i/o: {0}")]
	Io(#[from] std::io::Error),
	#[error("unexpected eof during tunnel handshake")]
	Eof,
	#[error("tunnel response head too large")]
	HeadTooLarge,
	#[error("malformed tunnel response")]
	Malformed,
	/// Non-2xx from the upstream; the parsed response is replayed to the
	/// client verbatim.
	#[error("upstream proxy rejected the tunnel ({status})")]
	Rejected {
		status: StatusCode,
		response: Box<Response<Body>>,
	},
}

/// Issues a CONNECT to an upstream proxy. On the wire this is exactly the
/// CONNECT line, `Host`, and the optional `Proxy-Authorization`, nothing
/// else. Returns any bytes read past the response head; they belong to the
/// tunnel and must be forwarded to the client.
pub(crate) async fn handshake<S>(
	conn: &mut S,
	dest: &str,
	auth: Option<&HeaderValue>,
) -> Result<Vec<u8>, TunnelError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut request = Vec::with_capacity(128);
	request.extend_from_slice(format!("CONNECT {dest} HTTP/1.1\r\nHost: {dest}\r\n").as_bytes());
	if let Some(auth) = auth {
		request.extend_from_slice(b"Proxy-Authorization: ");
		request.extend_from_slice(auth.as_bytes());
		request.extend_from_slice(b"\r\n");
	}
	request.extend_from_slice(b"\r\n");
	conn.write_all(&request).await?;

	let mut buf = [0u8; MAX_RESPONSE_HEAD];
	let mut pos = 0;
	loop {
		let n = conn.read(&mut buf[pos..]).await?;
		if n == 0 {
			return Err(TunnelError::Eof);
		}
		pos += n;

		if let Some(head_len) = head_end(&buf[..pos]) {
			return finish(&buf[..head_len], &buf[head_len..pos]);
		}
		if pos == buf.len() {
			return Err(TunnelError::HeadTooLarge);
		}
	}
}

fn head_end(buf: &[u8]) -> Option<usize> {
	buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn finish(head: &[u8], leftover: &[u8]) -> Result<Vec<u8>, TunnelError> {
	let mut headers = [httparse::EMPTY_HEADER; 32];
	let mut parsed = httparse::Response::new(&mut headers);
	match parsed.parse(head) {
		Ok(httparse::Status::Complete(_)) => {},
		_ => return Err(TunnelError::Malformed),
	}
	let code = parsed.code.ok_or(TunnelError::Malformed)?;
	let status = StatusCode::from_u16(code).map_err(|_| TunnelError::Malformed)?;
	if status.is_success() {
		return Ok(leftover.to_vec());
	}

	// Replay the rejection to the client. The body is whatever the upstream
	// sent alongside the head; framing headers are dropped so the replayed
	// response is self-consistent.
	let mut response = Response::new(full_body(leftover.to_vec()));
	*response.status_mut() = status;
	for h in parsed.headers.iter() {
		if h.name.eq_ignore_ascii_case("content-length")
			|| h.name.eq_ignore_ascii_case("transfer-encoding")
		{
			continue;
		}
		let Ok(name) = HeaderName::from_bytes(h.name.as_bytes()) else {
			continue;
		};
		let Ok(value) = HeaderValue::from_bytes(h.value) else {
			continue;
		};
		response.headers_mut().append(name, value);
	}
	response
		.headers_mut()
		.insert(header::CONNECTION, HeaderValue::from_static("close"));
	Err(TunnelError::Rejected {
		status,
		response: Box::new(response),
	})
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;
	use tokio::io::duplex;

	use super::*;

	async fn upstream_reply(reply: &'static [u8]) -> (Result<Vec<u8>, TunnelError>, Vec<u8>) {
		let (mut client, mut server) = duplex(16 * 1024);
		let server_task = tokio::spawn(async move {
			let mut seen = vec![0u8; 4096];
			let n = server.read(&mut seen).await.unwrap();
			server.write_all(reply).await.unwrap();
			seen.truncate(n);
			seen
		});
		let result = handshake(&mut client, "x.test:443", None).await;
		(result, server_task.await.unwrap())
	}

	#[tokio::test]
	async fn sends_exactly_the_connect_head() {
		let (result, seen) = upstream_reply(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
		assert!(result.unwrap().is_empty());
		assert_eq!(
			seen,
			b"CONNECT x.test:443 HTTP/1.1\r\nHost: x.test:443\r\n\r\n"
		);
	}

	#[tokio::test]
	async fn includes_proxy_authorization_when_given() {
		let (mut client, mut server) = duplex(16 * 1024);
		let server_task = tokio::spawn(async move {
			let mut seen = vec![0u8; 4096];
			let n = server.read(&mut seen).await.unwrap();
			server
				.write_all(b"HTTP/1.0 200 OK\r\n\r\n")
				.await
				.unwrap();
			seen.truncate(n);
			String::from_utf8(seen).unwrap()
		});
		let auth = HeaderValue::from_static("Basic dTpw");
		handshake(&mut client, "x.test:443", Some(&auth)).await.unwrap();
		let seen = server_task.await.unwrap();
		assert!(seen.contains("Proxy-Authorization: Basic dTpw\r\n"));
		assert!(seen.ends_with("\r\n\r\n"));
	}

	#[tokio::test]
	async fn returns_bytes_past_the_head() {
		let (result, _) =
			upstream_reply(b"HTTP/1.1 200 Connection established\r\n\r\nearly-tunnel-bytes").await;
		assert_eq!(result.unwrap(), b"early-tunnel-bytes");
	}

	#[tokio::test]
	async fn rejection_is_replayed_with_headers() {
		let (result, _) = upstream_reply(
			b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"up\"\r\nContent-Length: 4\r\n\r\ndeny",
		)
		.await;
		let Err(TunnelError::Rejected { status, response }) = result else {
			panic!("expected rejection");
		};
		assert_eq!(status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
		assert_eq!(
			response.headers().get(header::PROXY_AUTHENTICATE).unwrap().to_str().unwrap(),
			"Basic realm=\"up\""
		);
		// Framing headers are rebuilt, not copied.
		assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
		let body = response.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(body, "deny");
	}

	#[tokio::test]
	async fn eof_and_garbage_fail() {
		let (result, _) = upstream_reply(b"").await;
		assert!(matches!(result, Err(TunnelError::Eof)));

		let (result, _) = upstream_reply(b"not-http\r\n\r\n").await;
		assert!(matches!(result, Err(TunnelError::Malformed)));
	}
}
