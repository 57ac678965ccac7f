#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use forwarder::{
	Body, ForwardingConfig, HttpServer, Proxy, ProxyAuthConfig, ProxyTrace, Resolver, ServerConfig,
	WroteResponse,
};
use http::{Request, Response};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub fn empty_body() -> Body {
	Empty::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> Body {
	Full::new(data.into()).map_err(|never| match never {}).boxed()
}

#[derive(Clone, Default)]
pub struct TraceLog {
	pub count: Arc<AtomicUsize>,
	pub last: Arc<std::sync::Mutex<Option<WroteResponse>>>,
}

impl TraceLog {
	pub fn hooks(&self) -> ProxyTrace {
		let log = self.clone();
		ProxyTrace {
			wrote_response: Some(Arc::new(move |info| {
				log.count.fetch_add(1, Ordering::SeqCst);
				*log.last.lock().unwrap() = Some(info);
			})),
		}
	}

	pub fn calls(&self) -> usize {
		self.count.load(Ordering::SeqCst)
	}

	pub fn last_error(&self) -> Option<String> {
		self.last.lock().unwrap().as_ref().and_then(|i| i.error.clone())
	}

	/// Trace hooks fire after the response is fully streamed; give them a
	/// moment.
	pub async fn wait_for_calls(&self, n: usize) {
		for _ in 0..200 {
			if self.calls() >= n {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("trace hook fired {} times, expected {n}", self.calls());
	}
}

pub struct TestProxy {
	pub addr: SocketAddr,
	pub trace: TraceLog,
	cancel: CancellationToken,
	task: tokio::task::JoinHandle<()>,
}

impl TestProxy {
	pub async fn start(
		cfg: ForwardingConfig,
		auth: Option<ProxyAuthConfig>,
		resolver: Resolver,
	) -> Self {
		let trace = TraceLog::default();
		let proxy = Proxy::new(cfg, auth, resolver)
			.await
			.expect("proxy setup")
			.with_trace(trace.hooks());
		let port = find_free_port().await;
		let server = HttpServer::new(
			ServerConfig {
				addr: format!("127.0.0.1:{port}"),
				read_timeout: Duration::from_secs(30),
				..Default::default()
			},
			Arc::new(proxy),
		)
		.expect("server setup");

		let cancel = CancellationToken::new();
		let run_cancel = cancel.clone();
		let task = tokio::task::spawn(async move {
			server.run(run_cancel).await.expect("server run");
		});
		let addr = SocketAddr::from(([127, 0, 0, 1], port));
		wait_for_port(addr).await;
		Self {
			addr,
			trace,
			cancel,
			task,
		}
	}

	pub async fn shutdown(self) {
		self.cancel.cancel();
		let _ = self.task.await;
	}
}

pub async fn find_free_port() -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	listener.local_addr().expect("local addr").port()
}

pub async fn wait_for_port(addr: SocketAddr) {
	for _ in 0..200 {
		if TcpStream::connect(addr).await.is_ok() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("{addr} did not come up");
}

/// Opens a dedicated HTTP/1.1 connection to the proxy and sends one
/// request, keeping the connection task alive for upgrades.
pub async fn send_through(proxy: SocketAddr, req: Request<Body>) -> Response<Incoming> {
	let stream = TcpStream::connect(proxy).await.expect("connect to proxy");
	let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
		.await
		.expect("handshake");
	tokio::spawn(async move {
		let _ = conn.with_upgrades().await;
	});
	sender.send_request(req).await.expect("send request")
}

pub async fn read_text(resp: Response<Incoming>) -> String {
	let bytes = resp.into_body().collect().await.expect("body").to_bytes();
	String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

/// Minimal origin for CONNECT tests: accepts one connection at a time,
/// reads a request head and answers 200 with the given body.
pub async fn start_raw_origin(body: &'static str) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
	let addr = listener.local_addr().expect("origin addr");
	tokio::spawn(async move {
		loop {
			let Ok((mut stream, _)) = listener.accept().await else {
				return;
			};
			tokio::spawn(async move {
				if read_head(&mut stream).await.is_none() {
					return;
				}
				let reply = format!(
					"HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
					body.len(),
					body
				);
				let _ = stream.write_all(reply.as_bytes()).await;
			});
		}
	});
	addr
}

#[derive(Clone, Copy)]
pub enum UpstreamBehavior {
	/// CONNECT: answer 200 and splice to the requested target.
	ConnectThrough,
	/// CONNECT or plain: answer 407 with a Proxy-Authenticate challenge.
	Reject407,
	/// Plain HTTP proxying: answer 200 with a fixed body.
	HttpOk,
}

pub struct FakeUpstream {
	pub addr: SocketAddr,
	/// Request heads seen, one string per connection.
	pub seen: Arc<Mutex<Vec<String>>>,
}

/// A hand-rolled upstream proxy that records every request head it sees.
pub async fn start_fake_upstream(behavior: UpstreamBehavior) -> FakeUpstream {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
	let addr = listener.local_addr().expect("upstream addr");
	let seen = Arc::new(Mutex::new(Vec::new()));
	let record = seen.clone();
	tokio::spawn(async move {
		loop {
			let Ok((mut stream, _)) = listener.accept().await else {
				return;
			};
			let record = record.clone();
			tokio::spawn(async move {
				let Some(head) = read_head(&mut stream).await else {
					return;
				};
				record.lock().await.push(head.clone());
				match behavior {
					UpstreamBehavior::Reject407 => {
						let _ = stream
							.write_all(
								b"HTTP/1.1 407 Proxy Authentication Required\r\n\
								Proxy-Authenticate: Basic realm=\"up\"\r\n\
								Content-Length: 0\r\n\r\n",
							)
							.await;
					},
					UpstreamBehavior::HttpOk => {
						let _ = stream
							.write_all(
								b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: close\r\n\r\nupstream",
							)
							.await;
					},
					UpstreamBehavior::ConnectThrough => {
						let Some(target) = head
							.lines()
							.next()
							.and_then(|line| line.split_whitespace().nth(1))
							.map(str::to_string)
						else {
							return;
						};
						let Ok(mut origin) = TcpStream::connect(&target).await else {
							let _ = stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
							return;
						};
						let _ = stream
							.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
							.await;
						let _ = tokio::io::copy_bidirectional(&mut stream, &mut origin).await;
					},
				}
			});
		}
	});
	FakeUpstream { addr, seen }
}

async fn read_head(stream: &mut TcpStream) -> Option<String> {
	let mut buf = Vec::with_capacity(1024);
	let mut chunk = [0u8; 1024];
	loop {
		let n = stream.read(&mut chunk).await.ok()?;
		if n == 0 {
			return None;
		}
		buf.extend_from_slice(&chunk[..n]);
		if buf.windows(4).any(|w| w == b"\r\n\r\n") {
			return String::from_utf8(buf).ok();
		}
		if buf.len() > 64 * 1024 {
			return None;
		}
	}
}

/// Speaks HTTP/1.1 by hand over an established CONNECT tunnel.
pub async fn roundtrip_over_tunnel(
	upgraded: hyper::upgrade::Upgraded,
	host: &str,
) -> String {
	let mut io = TokioIo::new(upgraded);
	let request = format!("GET /tunneled HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
	io.write_all(request.as_bytes()).await.expect("tunnel write");
	let mut response = Vec::new();
	io.read_to_end(&mut response).await.expect("tunnel read");
	String::from_utf8(response).expect("tunnel response utf-8")
}

pub fn b64(s: &str) -> String {
	use base64::Engine;
	base64::engine::general_purpose::STANDARD.encode(s)
}
