mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use forwarder::{
	DnsConfig, ForwardingConfig, HttpServer, PacSource, Proxy, Resolver, Scheme, ServerConfig,
	TransportConfig, UserInfo,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

#[derive(Parser)]
#[command(name = "forwarder", version, about = "Forwarding HTTP proxy")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Start HTTP proxy. The proxy can listen to HTTP, HTTPS or HTTP2
	/// traffic, forward directly, via an upstream proxy or via PAC, use
	/// custom DNS servers, and inject basic auth for backend servers.
	Proxy(ProxyArgs),
}

#[derive(Args)]
struct ProxyArgs {
	/// HTTP server listen address
	#[arg(long, default_value = "localhost:3128")]
	addr: String,

	/// HTTP server protocol, one of http, https, h2
	#[arg(long, default_value = "http", value_parser = Scheme::from_str)]
	protocol: Scheme,

	/// HTTP server TLS certificate file
	#[arg(long)]
	cert_file: Option<PathBuf>,

	/// HTTP server TLS key file
	#[arg(long)]
	key_file: Option<PathBuf>,

	/// HTTP server read timeout
	#[arg(long, default_value = "5m", value_parser = parse_duration_flag)]
	read_timeout: Duration,

	/// Basic auth required from clients, in the form username:password
	#[arg(long, value_parser = parse_user_info)]
	basic_auth: Option<UserInfo>,

	/// Upstream proxy URI
	#[arg(long, short = 'u', value_parser = parse_proxy_url, conflicts_with = "pac_uri")]
	upstream_proxy_uri: Option<Url>,

	/// Upstream proxy basic auth in the form username:password
	#[arg(long, value_parser = parse_user_info)]
	upstream_proxy_basic_auth: Option<UserInfo>,

	/// URI to PAC content, or directly, the PAC content
	#[arg(long, short = 'p')]
	pac_uri: Option<String>,

	/// PAC proxies credentials using standard URI format (repeatable)
	#[arg(long, short = 'd', value_parser = parse_proxy_url)]
	pac_proxies_credentials: Vec<Url>,

	/// Target site credentials as user:pass@host:port, comma-separated
	#[arg(long, env = "FORWARDER_SITE_CREDENTIALS", value_delimiter = ',')]
	site_credentials: Vec<String>,

	/// If set, localhost requests are proxied to the upstream too
	#[arg(long, short = 't')]
	proxy_localhost: bool,

	/// DNS server, ex. -n udp://1.1.1.1:53 (repeatable)
	#[arg(long = "dns-server", short = 'n', value_parser = forwarder::dns::parse_dns_uri)]
	dns_servers: Vec<Url>,

	/// Timeout for DNS queries if DNS servers are specified
	#[arg(long, default_value = "5s", value_parser = parse_duration_flag)]
	dns_timeout: Duration,

	/// Dial timeout for HTTP connections
	#[arg(long, default_value = "30s", value_parser = parse_duration_flag)]
	http_dial_timeout: Duration,

	/// Keep alive interval for HTTP connections
	#[arg(long, default_value = "30s", value_parser = parse_duration_flag)]
	http_keep_alive: Duration,

	/// TLS handshake timeout for HTTP connections
	#[arg(long, default_value = "10s", value_parser = parse_duration_flag)]
	http_tls_handshake_timeout: Duration,

	/// Maximum number of idle connections
	#[arg(long, default_value_t = 100)]
	http_max_idle_conns: usize,

	/// Maximum number of idle connections per host
	#[arg(long, default_value_t = 2)]
	http_max_idle_conns_per_host: usize,

	/// Maximum number of connections per host, 0 means unlimited
	#[arg(long, default_value_t = 0)]
	http_max_conns_per_host: usize,

	/// Idle connection timeout
	#[arg(long, default_value = "90s", value_parser = parse_duration_flag)]
	http_idle_conn_timeout: Duration,

	/// Response header timeout, 0 disables it
	#[arg(long, default_value = "0s", value_parser = parse_duration_flag)]
	http_response_header_timeout: Duration,

	/// Expect continue timeout
	#[arg(long, default_value = "1s", value_parser = parse_duration_flag)]
	http_expect_continue_timeout: Duration,

	/// The log level
	#[arg(long, default_value = "info")]
	log_level: String,

	/// The log file level
	#[arg(long, default_value = "debug")]
	log_file_level: String,

	/// The log file path
	#[arg(long)]
	log_file_path: Option<PathBuf>,
}

fn parse_duration_flag(s: &str) -> Result<Duration, String> {
	match go_parse_duration::parse_duration(s) {
		Ok(nanos) if nanos >= 0 => Ok(Duration::from_nanos(nanos as u64)),
		Ok(_) => Err("duration must not be negative".to_string()),
		Err(e) => Err(format!("{e:?}")),
	}
}

fn parse_user_info(s: &str) -> Result<UserInfo, String> {
	UserInfo::parse("basic-auth", s).map_err(|e| e.reason)
}

fn parse_proxy_url(s: &str) -> Result<Url, String> {
	let url = Url::parse(s).map_err(|e| e.to_string())?;
	forwarder::config::validate_proxy_uri("uri", &url).map_err(|e| e.reason)?;
	Ok(url)
}

/// `--pac-uri` accepts an http(s) URI, a local file path, or the PAC
/// content itself.
fn resolve_pac_source(value: &str) -> anyhow::Result<PacSource> {
	if let Ok(url) = Url::parse(value) {
		match url.scheme() {
			"http" | "https" => return Ok(PacSource::Uri(url)),
			"file" => {
				let path = url
					.to_file_path()
					.map_err(|_| anyhow::anyhow!("invalid file URI: {value}"))?;
				return Ok(PacSource::Inline(std::fs::read_to_string(path)?));
			},
			_ => {},
		}
	}
	let path = std::path::Path::new(value);
	if path.is_file() {
		return Ok(PacSource::Inline(std::fs::read_to_string(path)?));
	}
	Ok(PacSource::Inline(value.to_string()))
}

fn merge_auth_env(var: &str, flag: Option<UserInfo>) -> anyhow::Result<Option<UserInfo>> {
	// The environment is applied after the flag and wins when both are set.
	match std::env::var(var) {
		Ok(value) if !value.is_empty() => Ok(Some(
			UserInfo::parse(var, &value).map_err(|e| anyhow::anyhow!("{e}"))?,
		)),
		_ => Ok(flag),
	}
}

struct Configs {
	server: ServerConfig,
	forwarding: ForwardingConfig,
	dns: DnsConfig,
}

fn build_configs(args: &ProxyArgs) -> anyhow::Result<Configs> {
	let tls = match (&args.cert_file, &args.key_file) {
		(Some(cert_file), Some(key_file)) => Some(forwarder::config::TlsFiles {
			cert_file: cert_file.clone(),
			key_file: key_file.clone(),
		}),
		(None, None) => None,
		_ => anyhow::bail!("cert-file and key-file must be provided together"),
	};

	let basic_auth = merge_auth_env("FORWARDER_LOCALPROXY_AUTH", args.basic_auth.clone())?;
	let server = ServerConfig {
		addr: args.addr.clone(),
		protocol: args.protocol,
		tls,
		read_timeout: args.read_timeout,
		basic_auth,
		..Default::default()
	};

	let mut upstream = args.upstream_proxy_uri.clone();
	let upstream_auth =
		merge_auth_env("FORWARDER_UPSTREAMPROXY_AUTH", args.upstream_proxy_basic_auth.clone())?;
	if let (Some(url), Some(auth)) = (upstream.as_mut(), upstream_auth) {
		// Assigns rather than merges: explicit auth replaces URI user info.
		url
			.set_username(auth.username())
			.and_then(|()| url.set_password(Some(auth.password())))
			.map_err(|_| anyhow::anyhow!("cannot attach credentials to upstream proxy URI"))?;
	}

	let pac = args.pac_uri.as_deref().map(resolve_pac_source).transpose()?;

	let forwarding = ForwardingConfig {
		upstream,
		pac,
		pac_proxies_credentials: args.pac_proxies_credentials.clone(),
		proxy_localhost: args.proxy_localhost,
		site_credentials: args.site_credentials.clone(),
		transport: TransportConfig {
			dial_timeout: args.http_dial_timeout,
			keep_alive: args.http_keep_alive,
			tls_handshake_timeout: args.http_tls_handshake_timeout,
			max_idle_conns: args.http_max_idle_conns,
			max_idle_conns_per_host: args.http_max_idle_conns_per_host,
			max_conns_per_host: args.http_max_conns_per_host,
			idle_conn_timeout: args.http_idle_conn_timeout,
			response_header_timeout: args.http_response_header_timeout,
			expect_continue_timeout: args.http_expect_continue_timeout,
		},
	};

	let dns = DnsConfig {
		servers: args.dns_servers.clone(),
		timeout: args.dns_timeout,
	};

	Ok(Configs {
		server,
		forwarding,
		dns,
	})
}

fn spawn_signal_handler(cancel: CancellationToken) {
	tokio::spawn(async move {
		use tokio::signal::unix::{SignalKind, signal};
		let (mut interrupt, mut terminate, mut quit) = match (
			signal(SignalKind::interrupt()),
			signal(SignalKind::terminate()),
			signal(SignalKind::quit()),
		) {
			(Ok(i), Ok(t), Ok(q)) => (i, t, q),
			_ => {
				error!("failed to install signal handlers");
				return;
			},
		};
		tokio::select! {
			_ = interrupt.recv() => {},
			_ = terminate.recv() => {},
			_ = quit.recv() => {},
		}
		info!("signal received, shutting down");
		cancel.cancel();
	});
}

const EXIT_CONFIG: u8 = 1;
const EXIT_RUNTIME: u8 = 2;

async fn proxy_command(args: ProxyArgs) -> ExitCode {
	let _log_guard = match logging::init(
		&args.log_level,
		&args.log_file_level,
		args.log_file_path.as_deref(),
	) {
		Ok(guard) => guard,
		Err(e) => {
			eprintln!("{e}");
			return ExitCode::from(EXIT_CONFIG);
		},
	};

	let configs = match build_configs(&args) {
		Ok(configs) => configs,
		Err(e) => {
			error!("{e}");
			return ExitCode::from(EXIT_CONFIG);
		},
	};

	let resolver = match Resolver::from_config(&configs.dns) {
		Ok(resolver) => resolver,
		Err(e) => {
			error!("{e}");
			return ExitCode::from(EXIT_CONFIG);
		},
	};

	let auth = configs.server.auth();
	let proxy = match Proxy::new(configs.forwarding, auth, resolver).await {
		Ok(proxy) => proxy,
		Err(e) => {
			error!("{e}");
			return ExitCode::from(EXIT_CONFIG);
		},
	};

	let server = match HttpServer::new(configs.server, Arc::new(proxy)) {
		Ok(server) => server,
		Err(e) => {
			error!("{e}");
			return ExitCode::from(EXIT_CONFIG);
		},
	};

	let cancel = CancellationToken::new();
	spawn_signal_handler(cancel.clone());
	match server.run(cancel).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			error!("{e}");
			ExitCode::from(EXIT_RUNTIME)
		},
	}
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	match cli.command {
		Command::Proxy(args) => proxy_command(args).await,
	}
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
