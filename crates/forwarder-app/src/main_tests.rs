use super::*;

// Each test uses its own variable name; the process environment is shared
// across the parallel test harness.

#[test]
fn env_credentials_override_the_flag() {
	let var = "FORWARDER_TEST_ENV_OVERRIDES_FLAG";
	unsafe { std::env::set_var(var, "env-user:env-pass") };
	let merged = merge_auth_env(var, Some(UserInfo::new("flag-user", "flag-pass")))
		.unwrap()
		.unwrap();
	assert_eq!(merged.username(), "env-user");
	assert_eq!(merged.password(), "env-pass");
	unsafe { std::env::remove_var(var) };
}

#[test]
fn flag_credentials_survive_unset_or_empty_env() {
	let var = "FORWARDER_TEST_ENV_ABSENT";
	unsafe { std::env::remove_var(var) };
	let merged = merge_auth_env(var, Some(UserInfo::new("flag-user", "flag-pass")))
		.unwrap()
		.unwrap();
	assert_eq!(merged.username(), "flag-user");

	unsafe { std::env::set_var(var, "") };
	let merged = merge_auth_env(var, Some(UserInfo::new("flag-user", "flag-pass")))
		.unwrap()
		.unwrap();
	assert_eq!(merged.username(), "flag-user");
	unsafe { std::env::remove_var(var) };

	assert!(merge_auth_env(var, None).unwrap().is_none());
}

#[test]
fn malformed_env_credentials_are_rejected() {
	let var = "FORWARDER_TEST_ENV_MALFORMED";
	unsafe { std::env::set_var(var, "no-separator") };
	assert!(merge_auth_env(var, None).is_err());
	unsafe { std::env::remove_var(var) };
}

const PAC_SCRIPT: &str = "function FindProxyForURL(url, host) { return \"DIRECT\"; }";

#[test]
fn pac_source_http_uri_stays_a_uri() {
	match resolve_pac_source("http://pac.test:8090/proxy.pac").unwrap() {
		PacSource::Uri(url) => assert_eq!(url.as_str(), "http://pac.test:8090/proxy.pac"),
		other => panic!("expected a URI source, got {other:?}"),
	}
}

#[test]
fn pac_source_file_uri_reads_the_file() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("proxy.pac");
	std::fs::write(&path, PAC_SCRIPT).unwrap();
	let uri = Url::from_file_path(&path).unwrap();
	match resolve_pac_source(uri.as_str()).unwrap() {
		PacSource::Inline(content) => assert_eq!(content, PAC_SCRIPT),
		other => panic!("expected inline content, got {other:?}"),
	}
}

#[test]
fn pac_source_plain_path_reads_the_file() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("proxy.pac");
	std::fs::write(&path, PAC_SCRIPT).unwrap();
	match resolve_pac_source(path.to_str().unwrap()).unwrap() {
		PacSource::Inline(content) => assert_eq!(content, PAC_SCRIPT),
		other => panic!("expected inline content, got {other:?}"),
	}
}

#[test]
fn pac_source_falls_back_to_inline_content() {
	match resolve_pac_source(PAC_SCRIPT).unwrap() {
		PacSource::Inline(content) => assert_eq!(content, PAC_SCRIPT),
		other => panic!("expected inline content, got {other:?}"),
	}
}

#[test]
fn missing_pac_file_uri_is_an_error() {
	let dir = tempfile::tempdir().unwrap();
	let uri = Url::from_file_path(dir.path().join("absent.pac")).unwrap();
	assert!(resolve_pac_source(uri.as_str()).is_err());
}

#[test]
fn durations_use_the_compact_form() {
	assert_eq!(parse_duration_flag("30s").unwrap(), Duration::from_secs(30));
	assert_eq!(parse_duration_flag("1m30s").unwrap(), Duration::from_secs(90));
	assert!(parse_duration_flag("-5s").is_err());
	assert!(parse_duration_flag("banana").is_err());
}
