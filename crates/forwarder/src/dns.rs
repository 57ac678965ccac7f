use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioResolver;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ServerOrderingStrategy};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use tracing::debug;
use url::Url;

use crate::config::ConfigError;
use crate::util::redacted;

/// DNS override configuration: explicit servers tried in order, each with
/// the per-query timeout.
#[derive(Clone, Debug)]
pub struct DnsConfig {
	/// Server URIs, ex. `udp://1.1.1.1:53`. Scheme must be udp or tcp, the
	/// host an IP literal, the port explicit.
	pub servers: Vec<Url>,
	pub timeout: Duration,
}

impl Default for DnsConfig {
	fn default() -> Self {
		Self {
			servers: Vec::new(),
			timeout: Duration::from_secs(5),
		}
	}
}

impl DnsConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.servers.is_empty() {
			return Err(ConfigError::new("dns.servers", "[]", "no DNS server configured"));
		}
		for (i, server) in self.servers.iter().enumerate() {
			validate_dns_uri(&format!("dns.servers[{i}]"), server)?;
		}
		Ok(())
	}
}

/// Parses and validates a single `--dns-server` value.
pub fn parse_dns_uri(s: &str) -> Result<Url, ConfigError> {
	let url = Url::parse(s)
		.map_err(|e| ConfigError::new("dns.servers", s, format!("not a URI: {e}")))?;
	validate_dns_uri("dns.servers", &url)?;
	Ok(url)
}

fn validate_dns_uri(field: &str, url: &Url) -> Result<(), ConfigError> {
	let (_, _) = dns_server_parts(field, url)?;
	Ok(())
}

fn dns_server_parts(field: &str, url: &Url) -> Result<(SocketAddr, Protocol), ConfigError> {
	let protocol = match url.scheme() {
		"udp" => Protocol::Udp,
		"tcp" => Protocol::Tcp,
		other => {
			return Err(ConfigError::new(
				field,
				other,
				"scheme must be udp or tcp",
			));
		},
	};
	let host = url
		.host_str()
		.ok_or_else(|| ConfigError::new(field, url.as_str(), "missing host"))?;
	let bare = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
	let ip: IpAddr = bare
		.parse()
		.map_err(|_| ConfigError::new(field, host, "host must be an IP address"))?;
	let port = url
		.port()
		.filter(|p| *p > 0)
		.ok_or_else(|| ConfigError::new(field, url.as_str(), "missing or zero port"))?;
	Ok((SocketAddr::new(ip, port), protocol))
}

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
	#[error("all DNS servers failed")]
	Exhausted(#[source] hickory_resolver::ResolveError),
	#[error("host resolution failed")]
	System(#[source] std::io::Error),
	#[error("host has no addresses")]
	NoRecords,
}

/// Resolver backed by the configured DNS servers. Servers are handed to
/// hickory in the configured order and queried one at a time, so failover
/// order is deterministic; hickory dials the server IPs directly and never
/// re-enters this resolver.
pub struct DnsResolver {
	inner: TokioResolver,
}

impl DnsResolver {
	pub fn new(cfg: &DnsConfig) -> Result<Self, ConfigError> {
		cfg.validate()?;

		let mut config = ResolverConfig::new();
		for (i, server) in cfg.servers.iter().enumerate() {
			let (addr, protocol) = dns_server_parts(&format!("dns.servers[{i}]"), server)?;
			config.add_name_server(NameServerConfig::new(addr, protocol));
		}

		let mut builder =
			TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
		let opts = builder.options_mut();
		opts.timeout = cfg.timeout;
		opts.server_ordering_strategy = ServerOrderingStrategy::UserProvidedOrder;
		opts.num_concurrent_reqs = 1;

		Ok(Self {
			inner: builder.build(),
		})
	}

	pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
		let lookup = self.inner.lookup_ip(host).await.map_err(ResolveError::Exhausted)?;
		let ips: Vec<IpAddr> = lookup.iter().collect();
		if ips.is_empty() {
			return Err(ResolveError::NoRecords);
		}
		debug!(host, ips = ?ips, "resolved via configured DNS");
		Ok(ips)
	}
}

impl std::fmt::Debug for DnsResolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DnsResolver").finish()
	}
}

/// Name resolution used by the dialer: either the ambient system resolver
/// or the configured override. Injected per engine, never a process global.
#[derive(Clone, Debug, Default)]
pub enum Resolver {
	#[default]
	System,
	Custom(Arc<DnsResolver>),
}

impl Resolver {
	pub fn from_config(cfg: &DnsConfig) -> Result<Self, ConfigError> {
		if cfg.servers.is_empty() {
			return Ok(Resolver::System);
		}
		for server in &cfg.servers {
			debug!(server = %redacted(server), "using DNS server");
		}
		Ok(Resolver::Custom(Arc::new(DnsResolver::new(cfg)?)))
	}

	pub(crate) async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, ResolveError> {
		// IP literals never hit a resolver.
		let bare = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
		if let Ok(ip) = bare.parse::<IpAddr>() {
			return Ok(vec![SocketAddr::new(ip, port)]);
		}
		match self {
			Resolver::System => {
				let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
					.await
					.map_err(ResolveError::System)?
					.collect();
				if addrs.is_empty() {
					return Err(ResolveError::NoRecords);
				}
				Ok(addrs)
			},
			Resolver::Custom(resolver) => {
				let ips = resolver.resolve(host).await?;
				Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
			},
		}
	}
}

#[cfg(test)]
#[path = "dns_tests.rs"]
mod tests;
