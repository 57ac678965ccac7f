use std::collections::HashMap;
use std::fmt;

use js_sandbox::Script;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use url::Url;

use crate::util::redacted;

/// Where the PAC script comes from: an http(s) URI, or the script text
/// itself.
#[derive(Clone, Debug)]
pub enum PacSource {
	Uri(Url),
	Inline(String),
}

impl PacSource {
	pub async fn load(&self) -> Result<String, PacError> {
		match self {
			PacSource::Uri(url) => {
				let client = reqwest::Client::builder()
					.no_proxy()
					.build()
					.map_err(PacError::Fetch)?;
				let body = client
					.get(url.as_str())
					.send()
					.await
					.and_then(|r| r.error_for_status())
					.map_err(PacError::Fetch)?
					.text()
					.await
					.map_err(PacError::Fetch)?;
				debug!(source = %redacted(url), bytes = body.len(), "loaded PAC script");
				Ok(body)
			},
			PacSource::Inline(script) => Ok(script.clone()),
		}
	}
}

impl fmt::Display for PacSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PacSource::Uri(url) => f.write_str(&redacted(url)),
			PacSource::Inline(_) => f.write_str("inline"),
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum PacError {
	#[error("failed to load PAC script")]
	Fetch(#[source] reqwest::Error),
	#[error("invalid PAC script: {0}")]
	Invalid(String),
	#[error("PAC evaluation failed: {0}")]
	Eval(String),
	#[error("invalid PAC directive: {0}")]
	Directive(String),
	#[error("PAC evaluator stopped")]
	Closed,
}

/// One entry of the ordered candidate list returned by `FindProxyForURL`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Candidate {
	Direct,
	Proxy(Url),
}

/// The classic pure-string PAC helpers. `dnsResolve` is deliberately not
/// provided; scripts relying on it fail evaluation rather than silently
/// resolving through the wrong resolver.
const PAC_PRELUDE: &str = r#"
function isPlainHostName(host) {
	return host.indexOf(".") === -1;
}
function dnsDomainIs(host, domain) {
	return host.length >= domain.length &&
		host.substring(host.length - domain.length) === domain;
}
function localHostOrDomainIs(host, hostdom) {
	return host === hostdom || hostdom.lastIndexOf(host + ".", 0) === 0;
}
function shExpMatch(str, shexp) {
	var pat = "";
	for (var i = 0; i < shexp.length; i++) {
		var c = shexp.charAt(i);
		if (c === "*") {
			pat += ".*";
		} else if (c === "?") {
			pat += ".";
		} else {
			pat += c.replace(/[.+^${}()|[\]\\]/g, "\\$&");
		}
	}
	return new RegExp("^" + pat + "$").test(str);
}
"#;

struct Job {
	url: String,
	host: String,
	reply: oneshot::Sender<Result<Option<String>, String>>,
}

/// Evaluates `FindProxyForURL(url, host)` for each request. The script runs
/// inside a sandboxed interpreter owned by a dedicated worker thread (the
/// isolate is not `Send`), so evaluation is serialized and callers suspend
/// on the reply channel.
pub struct PacEvaluator {
	jobs: mpsc::UnboundedSender<Job>,
	credentials: HashMap<(String, u16), (String, String)>,
}

impl PacEvaluator {
	pub async fn new(source: &PacSource, credentials: &[Url]) -> Result<Self, PacError> {
		let script = source.load().await?;
		let script = format!("{PAC_PRELUDE}\n{script}");

		let (jobs, rx) = mpsc::unbounded_channel();
		let (init_tx, init_rx) = oneshot::channel();
		std::thread::Builder::new()
			.name("pac-eval".to_string())
			.spawn(move || evaluator_thread(script, rx, init_tx))
			.map_err(|e| PacError::Invalid(format!("failed to start evaluator: {e}")))?;
		init_rx
			.await
			.map_err(|_| PacError::Closed)?
			.map_err(PacError::Invalid)?;

		let credentials = credentials
			.iter()
			.filter_map(|url| {
				let host = url.host_str()?.to_ascii_lowercase();
				let port = url.port_or_known_default()?;
				Some((
					(host, port),
					(url.username().to_string(), url.password().unwrap_or_default().to_string()),
				))
			})
			.collect();

		Ok(Self { jobs, credentials })
	}

	/// Returns the ordered candidate list for `url`. Safe to call from many
	/// request handlers; evaluation itself runs one call at a time.
	pub async fn find_proxy(&self, url: &str, host: &str) -> Result<Vec<Candidate>, PacError> {
		let (reply, rx) = oneshot::channel();
		self
			.jobs
			.send(Job {
				url: url.to_string(),
				host: host.to_string(),
				reply,
			})
			.map_err(|_| PacError::Closed)?;
		let directives = rx
			.await
			.map_err(|_| PacError::Closed)?
			.map_err(PacError::Eval)?;
		let Some(directives) = directives else {
			return Ok(Vec::new());
		};
		let mut candidates = parse_directives(&directives)?;
		for candidate in &mut candidates {
			if let Candidate::Proxy(url) = candidate {
				self.add_credentials(url);
			}
		}
		Ok(candidates)
	}

	fn add_credentials(&self, url: &mut Url) {
		if !url.username().is_empty() {
			return;
		}
		let Some(host) = url.host_str().map(|h| h.to_ascii_lowercase()) else {
			return;
		};
		let Some(port) = url.port_or_known_default() else {
			return;
		};
		if let Some((user, pass)) = self.credentials.get(&(host, port)) {
			let _ = url.set_username(user);
			let _ = url.set_password(Some(pass));
		}
	}
}

impl fmt::Debug for PacEvaluator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PacEvaluator")
			.field("credentials", &self.credentials.len())
			.finish()
	}
}

fn evaluator_thread(
	script: String,
	mut jobs: mpsc::UnboundedReceiver<Job>,
	init: oneshot::Sender<Result<(), String>>,
) {
	let mut script = match Script::from_string(&script) {
		Ok(script) => script,
		Err(e) => {
			let _ = init.send(Err(e.to_string()));
			return;
		},
	};
	// Probe once so a missing or broken FindProxyForURL fails construction,
	// not the first request.
	if let Err(e) =
		script.call::<_, Option<String>>("FindProxyForURL", ("http://probe.invalid/", "probe.invalid"))
	{
		let _ = init.send(Err(e.to_string()));
		return;
	}
	if init.send(Ok(())).is_err() {
		return;
	}
	while let Some(job) = jobs.blocking_recv() {
		let result = script
			.call::<_, Option<String>>("FindProxyForURL", (job.url.as_str(), job.host.as_str()))
			.map_err(|e| e.to_string());
		let _ = job.reply.send(result);
	}
}

/// Parses the `FindProxyForURL` return grammar: a `;`-separated list of
/// `DIRECT`, `PROXY host:port`, `HTTP host:port`, `HTTPS host:port`,
/// `SOCKS host:port` or `SOCKS5 host:port`.
fn parse_directives(s: &str) -> Result<Vec<Candidate>, PacError> {
	let mut out = Vec::new();
	for part in s.split(';') {
		let part = part.trim();
		if part.is_empty() {
			continue;
		}
		let (keyword, rest) = match part.split_once(char::is_whitespace) {
			Some((k, r)) => (k, r.trim()),
			None => (part, ""),
		};
		let scheme = match keyword.to_ascii_uppercase().as_str() {
			"DIRECT" => {
				out.push(Candidate::Direct);
				continue;
			},
			"PROXY" | "HTTP" => "http",
			"HTTPS" => "https",
			"SOCKS" | "SOCKS5" => "socks5",
			_ => return Err(PacError::Directive(part.to_string())),
		};
		if rest.is_empty() {
			return Err(PacError::Directive(part.to_string()));
		}
		let url = Url::parse(&format!("{scheme}://{rest}"))
			.map_err(|_| PacError::Directive(part.to_string()))?;
		if url.host_str().is_none() || url.port_or_known_default().is_none() {
			return Err(PacError::Directive(part.to_string()));
		}
		out.push(Candidate::Proxy(url));
	}
	Ok(out)
}

#[cfg(test)]
#[path = "pac_tests.rs"]
mod tests;
