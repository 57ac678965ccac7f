use std::net::{IpAddr, Ipv4Addr};

use super::*;

fn cfg(servers: &[&str]) -> DnsConfig {
	DnsConfig {
		servers: servers.iter().map(|s| Url::parse(s).unwrap()).collect(),
		..Default::default()
	}
}

#[test]
fn empty_server_list_is_invalid() {
	let err = DnsConfig::default().validate().unwrap_err();
	assert_eq!(err.field, "dns.servers");
}

#[test]
fn accepts_udp_and_tcp_ip_servers() {
	cfg(&["udp://1.1.1.1:53", "tcp://8.8.8.8:53", "udp://[::1]:5353"])
		.validate()
		.unwrap();
}

#[test]
fn rejects_bad_scheme_host_and_port() {
	assert!(parse_dns_uri("https://1.1.1.1:53").is_err());
	assert!(parse_dns_uri("udp://dns.example.com:53").is_err());
	assert!(parse_dns_uri("udp://1.1.1.1").is_err());
	assert!(parse_dns_uri("udp://1.1.1.1:0").is_err());
	assert!(parse_dns_uri("not a uri").is_err());
}

#[test]
fn validation_reports_offending_index() {
	let err = cfg(&["udp://1.1.1.1:53", "udp://bad.example.com:53"])
		.validate()
		.unwrap_err();
	assert_eq!(err.field, "dns.servers[1]");
}

#[tokio::test]
async fn ip_literals_bypass_resolution() {
	// The system variant must not be consulted for literals; a lookup of an
	// IP through any resolver yields exactly that address.
	let addrs = Resolver::System.lookup("192.0.2.7", 8080).await.unwrap();
	assert_eq!(
		addrs,
		vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)), 8080)]
	);

	let addrs = Resolver::System.lookup("[::1]", 53).await.unwrap();
	assert_eq!(addrs[0].port(), 53);
	assert!(addrs[0].ip().is_loopback());
}

/// Stub DNS server answering every A query with the given address.
async fn start_stub_dns(answer: [u8; 4]) -> SocketAddr {
	let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
	let addr = socket.local_addr().unwrap();
	tokio::spawn(async move {
		let mut buf = [0u8; 512];
		loop {
			let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
				return;
			};
			if n < 12 {
				continue;
			}
			// Walk the question name to find qtype and the question end.
			let mut pos = 12;
			while pos < n && buf[pos] != 0 {
				pos += 1 + buf[pos] as usize;
			}
			pos += 1;
			if pos + 4 > n {
				continue;
			}
			let qtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
			let question_end = pos + 4;

			let ancount: u16 = if qtype == 1 { 1 } else { 0 };
			let mut resp = Vec::with_capacity(question_end + 16);
			resp.extend_from_slice(&buf[..2]); // ID
			resp.extend_from_slice(&[0x81, 0x80]); // QR, RD, RA, NOERROR
			resp.extend_from_slice(&[0, 1]); // QDCOUNT
			resp.extend_from_slice(&ancount.to_be_bytes());
			resp.extend_from_slice(&[0, 0, 0, 0]); // NSCOUNT, ARCOUNT
			resp.extend_from_slice(&buf[12..question_end]);
			if ancount == 1 {
				resp.extend_from_slice(&[0xC0, 0x0C]); // name: pointer to question
				resp.extend_from_slice(&[0, 1, 0, 1]); // TYPE A, CLASS IN
				resp.extend_from_slice(&[0, 0, 0, 60]); // TTL
				resp.extend_from_slice(&[0, 4]);
				resp.extend_from_slice(&answer);
			}
			let _ = socket.send_to(&resp, peer).await;
		}
	});
	addr
}

#[tokio::test]
async fn custom_resolver_queries_only_the_configured_server() {
	let stub = start_stub_dns([10, 0, 0, 5]).await;
	let resolver = DnsResolver::new(&DnsConfig {
		servers: vec![Url::parse(&format!("udp://{stub}")).unwrap()],
		timeout: std::time::Duration::from_secs(2),
	})
	.unwrap();
	let ips = resolver.resolve("httpbin.local").await.unwrap();
	assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))]);
}

#[tokio::test]
async fn custom_resolver_reports_exhaustion() {
	// 192.0.2.0/24 is TEST-NET; nothing answers there. Keep the timeout
	// short so the test stays fast.
	let resolver = DnsResolver::new(&DnsConfig {
		servers: vec![Url::parse("udp://192.0.2.1:53").unwrap()],
		timeout: std::time::Duration::from_millis(250),
	})
	.unwrap();
	let err = resolver.resolve("httpbin.local").await.unwrap_err();
	assert!(matches!(err, ResolveError::Exhausted(_)));
}
