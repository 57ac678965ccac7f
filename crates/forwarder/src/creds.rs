use std::collections::HashMap;
use std::fmt;

use http::HeaderValue;
use tracing::debug;
use url::Url;

use crate::config::ConfigError;
use crate::util::basic_auth_value;

/// Immutable map from `(host, port)` to a ready-to-send `Authorization`
/// value, built once at startup from the site-credential list. A port of 0
/// matches any port for that host; an exact entry always wins over the
/// wildcard.
#[derive(Default)]
pub struct SiteMatcher {
	entries: HashMap<(String, u16), HeaderValue>,
}

impl SiteMatcher {
	pub fn new(credentials: &[String]) -> Result<Self, ConfigError> {
		let mut entries = HashMap::with_capacity(credentials.len());
		for (i, raw) in credentials.iter().enumerate() {
			let field = format!("site_credentials[{i}]");
			let (key, value, username) = parse_entry(&field, raw)?;
			debug!(host = %key.0, port = key.1, user = %username, "site credential registered");
			if entries.insert(key.clone(), value).is_some() {
				return Err(ConfigError::new(
					field,
					format!("{}:{}", key.0, key.1),
					"duplicate credential for host:port",
				));
			}
		}
		Ok(Self { entries })
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Looks up `host:port`; tries the exact port first, then the wildcard.
	pub fn matching(&self, host: &str, port: u16) -> Option<&HeaderValue> {
		let host = host.to_ascii_lowercase();
		self.entries
			.get(&(host.clone(), port))
			.or_else(|| self.entries.get(&(host, 0)))
	}
}

impl fmt::Debug for SiteMatcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SiteMatcher")
			.field("entries", &self.entries.len())
			.finish()
	}
}

/// Accepts both full URIs (`https://u:p@host:4443`) and the bare
/// `u:p@host:port` form. A bare entry gets an implied scheme: https when
/// the port is 443, http otherwise.
fn parse_entry(
	field: &str,
	raw: &str,
) -> Result<((String, u16), HeaderValue, String), ConfigError> {
	let raw = raw.trim();
	let normalized = if raw.contains("://") {
		raw.to_string()
	} else if raw.ends_with(":443") {
		format!("https://{raw}")
	} else {
		format!("http://{raw}")
	};
	let url = Url::parse(&normalized)
		.map_err(|e| ConfigError::new(field, raw, format!("not a credential URI: {e}")))?;

	let username = url.username().to_string();
	if username.is_empty() {
		return Err(ConfigError::new(field, raw, "missing username"));
	}
	let password = url.password().unwrap_or_default().to_string();
	let host = url
		.host_str()
		.map(|h| h.to_ascii_lowercase())
		.filter(|h| !h.is_empty())
		.ok_or_else(|| ConfigError::new(field, raw, "missing host"))?;
	let port = url
		.port_or_known_default()
		.ok_or_else(|| ConfigError::new(field, raw, "missing port"))?;

	Ok(((host, port), basic_auth_value(&username, &password), username))
}

#[cfg(test)]
#[path = "creds_tests.rs"]
mod tests;
