use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use http::HeaderName;
use url::Url;

use crate::pac::PacSource;
use crate::util::redacted;

/// A configuration field failed validation. Carries the field path and the
/// offending value (already redacted where it may hold credentials).
#[derive(thiserror::Error, Debug)]
#[error("invalid {field}: {reason} (got {value:?})")]
pub struct ConfigError {
	pub field: String,
	pub value: String,
	pub reason: String,
}

impl ConfigError {
	pub fn new(
		field: impl Into<String>,
		value: impl Into<String>,
		reason: impl Into<String>,
	) -> Self {
		Self {
			field: field.into(),
			value: value.into(),
			reason: reason.into(),
		}
	}
}

/// Basic-auth user info. The password is kept out of `Debug` and `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct UserInfo {
	username: String,
	password: String,
}

impl UserInfo {
	pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
		Self {
			username: username.into(),
			password: password.into(),
		}
	}

	/// Parses the `user:pass` form. The username must be non-empty; the
	/// password may be empty.
	pub fn parse(field: &str, s: &str) -> Result<Self, ConfigError> {
		let Some((user, pass)) = s.split_once(':') else {
			return Err(ConfigError::new(field, "<redacted>", "expected user:pass"));
		};
		if user.is_empty() {
			return Err(ConfigError::new(field, "<redacted>", "empty username"));
		}
		Ok(Self::new(user, pass))
	}

	pub fn username(&self) -> &str {
		&self.username
	}

	pub fn password(&self) -> &str {
		&self.password
	}
}

impl fmt::Debug for UserInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("UserInfo")
			.field("username", &self.username)
			.field("password", &"xxxxx")
			.finish()
	}
}

impl fmt::Display for UserInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:xxxxx", self.username)
	}
}

/// Listener protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scheme {
	Http,
	Https,
	H2,
}

impl Scheme {
	pub fn as_str(&self) -> &'static str {
		match self {
			Scheme::Http => "http",
			Scheme::Https => "https",
			Scheme::H2 => "h2",
		}
	}
}

impl std::str::FromStr for Scheme {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"http" => Ok(Scheme::Http),
			"https" => Ok(Scheme::Https),
			"h2" => Ok(Scheme::H2),
			other => Err(ConfigError::new(
				"protocol",
				other,
				"expected one of http, https, h2",
			)),
		}
	}
}

impl fmt::Display for Scheme {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// How the next hop is chosen for a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
	Direct,
	Upstream,
	Pac,
}

impl fmt::Display for Mode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Mode::Direct => "direct",
			Mode::Upstream => "upstream",
			Mode::Pac => "pac",
		})
	}
}

/// Schemes accepted in proxy URIs. Only http and https are dialable; socks
/// and quic pass validation and are rejected when selected.
const PROXY_URI_SCHEMES: &[&str] = &["http", "https", "socks", "socks5", "quic"];

pub fn validate_proxy_uri(field: &str, url: &Url) -> Result<(), ConfigError> {
	if !PROXY_URI_SCHEMES.contains(&url.scheme()) {
		return Err(ConfigError::new(
			field,
			redacted(url),
			"scheme must be one of http, https, socks, socks5, quic",
		));
	}
	if url.host_str().is_none() {
		return Err(ConfigError::new(field, redacted(url), "missing host"));
	}
	if url.port_or_known_default().is_none() {
		return Err(ConfigError::new(field, redacted(url), "missing port"));
	}
	Ok(())
}

/// Proxy-level authentication: credentials every incoming request must
/// present, and the header carrying them.
#[derive(Clone, Debug)]
pub struct ProxyAuthConfig {
	pub credentials: UserInfo,
	pub header: HeaderName,
}

impl ProxyAuthConfig {
	pub fn new(credentials: UserInfo) -> Self {
		Self {
			credentials,
			header: http::header::PROXY_AUTHORIZATION,
		}
	}
}

/// TLS material for https/h2 listeners.
#[derive(Clone, Debug)]
pub struct TlsFiles {
	pub cert_file: PathBuf,
	pub key_file: PathBuf,
}

/// Listener-side configuration consumed by the server shell.
#[derive(Clone, Debug)]
pub struct ServerConfig {
	/// Listen address in `host:port` form.
	pub addr: String,
	pub protocol: Scheme,
	pub tls: Option<TlsFiles>,
	pub read_timeout: Duration,
	pub basic_auth: Option<UserInfo>,
	pub basic_auth_header: HeaderName,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			addr: "localhost:3128".to_string(),
			protocol: Scheme::Http,
			tls: None,
			read_timeout: Duration::from_secs(5 * 60),
			basic_auth: None,
			basic_auth_header: http::header::PROXY_AUTHORIZATION,
		}
	}
}

impl ServerConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if !self.addr.contains(':') {
			return Err(ConfigError::new("addr", &self.addr, "expected host:port"));
		}
		if matches!(self.protocol, Scheme::Https | Scheme::H2) && self.tls.is_none() {
			return Err(ConfigError::new(
				"cert_file",
				"",
				format!("{} listener requires cert and key files", self.protocol),
			));
		}
		Ok(())
	}

	pub fn auth(&self) -> Option<ProxyAuthConfig> {
		self.basic_auth.clone().map(|credentials| ProxyAuthConfig {
			credentials,
			header: self.basic_auth_header.clone(),
		})
	}
}

/// Outbound transport tunings, mirroring the dialer/pool phases: dial, TLS
/// handshake, pooled-idle accounting and the response-header wait.
#[derive(Clone, Debug)]
pub struct TransportConfig {
	pub dial_timeout: Duration,
	pub keep_alive: Duration,
	pub tls_handshake_timeout: Duration,
	pub max_idle_conns: usize,
	pub max_idle_conns_per_host: usize,
	/// 0 means unlimited.
	pub max_conns_per_host: usize,
	pub idle_conn_timeout: Duration,
	/// 0 disables the response-header timeout.
	pub response_header_timeout: Duration,
	pub expect_continue_timeout: Duration,
}

impl Default for TransportConfig {
	fn default() -> Self {
		Self {
			dial_timeout: Duration::from_secs(30),
			keep_alive: Duration::from_secs(30),
			tls_handshake_timeout: Duration::from_secs(10),
			max_idle_conns: 100,
			max_idle_conns_per_host: 2,
			max_conns_per_host: 0,
			idle_conn_timeout: Duration::from_secs(90),
			response_header_timeout: Duration::ZERO,
			expect_continue_timeout: Duration::from_secs(1),
		}
	}
}

impl TransportConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.dial_timeout.is_zero() {
			return Err(ConfigError::new(
				"transport.dial_timeout",
				"0s",
				"must be positive",
			));
		}
		if self.max_idle_conns_per_host > self.max_idle_conns && self.max_idle_conns > 0 {
			return Err(ConfigError::new(
				"transport.max_idle_conns_per_host",
				self.max_idle_conns_per_host.to_string(),
				"must not exceed transport.max_idle_conns",
			));
		}
		Ok(())
	}
}

/// Forwarding behavior: how to reach origins, which credentials to inject,
/// and the transport tunings.
#[derive(Clone, Debug, Default)]
pub struct ForwardingConfig {
	/// Fixed upstream proxy. Mutually exclusive with `pac`.
	pub upstream: Option<Url>,
	/// PAC source. Mutually exclusive with `upstream`.
	pub pac: Option<PacSource>,
	/// Credentials merged into PAC-returned proxies, matched by host:port.
	pub pac_proxies_credentials: Vec<Url>,
	/// When false, requests to loopback destinations never use an upstream.
	pub proxy_localhost: bool,
	/// `user:pass@host:port` entries; port 0 matches any port.
	pub site_credentials: Vec<String>,
	pub transport: TransportConfig,
}

impl ForwardingConfig {
	pub fn mode(&self) -> Mode {
		if self.upstream.is_some() {
			Mode::Upstream
		} else if self.pac.is_some() {
			Mode::Pac
		} else {
			Mode::Direct
		}
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.upstream.is_some() && self.pac.is_some() {
			return Err(ConfigError::new(
				"upstream",
				"",
				"upstream proxy and PAC cannot both be set",
			));
		}
		if let Some(upstream) = &self.upstream {
			validate_proxy_uri("upstream", upstream)?;
		}
		for (i, cred) in self.pac_proxies_credentials.iter().enumerate() {
			validate_proxy_uri(&format!("pac_proxies_credentials[{i}]"), cred)?;
			if cred.username().is_empty() {
				return Err(ConfigError::new(
					format!("pac_proxies_credentials[{i}]"),
					redacted(cred),
					"missing user info",
				));
			}
		}
		self.transport.validate()
	}
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
