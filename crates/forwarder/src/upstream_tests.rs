use assert_matches::assert_matches;

use super::*;
use crate::pac::PacSource;

fn upstream(uri: &str) -> Router {
	Router::upstream(Url::parse(uri).unwrap(), false)
}

#[tokio::test]
async fn direct_mode_never_yields_an_upstream() {
	let router = Router::direct(false);
	let via = router.select("http://example.test/", "example.test").await.unwrap();
	assert!(via.is_none());
}

#[tokio::test]
async fn upstream_mode_yields_the_configured_proxy() {
	let router = upstream("http://up.test:9000");
	let via = router
		.select("http://example.test/", "example.test")
		.await
		.unwrap()
		.unwrap();
	assert_eq!(via.url.as_str(), "http://up.test:9000");
	assert!(via.auth.is_none());
}

#[tokio::test]
async fn upstream_credentials_become_a_proxy_authorization_value() {
	let router = upstream("http://u:p@up.test:9000");
	let via = router
		.select("http://example.test/", "example.test")
		.await
		.unwrap()
		.unwrap();
	let auth = via.auth.unwrap();
	assert_eq!(auth.to_str().unwrap(), "Basic dTpw");
	assert!(auth.is_sensitive());
}

#[tokio::test]
async fn localhost_bypasses_upstream_unless_opted_in() {
	let router = upstream("http://up.test:9000");
	for host in ["localhost", "127.0.0.1", "127.1.2.3", "::1"] {
		let via = router.select("http://h/", host).await.unwrap();
		assert!(via.is_none(), "{host}");
	}

	let router = Router::upstream(Url::parse("http://up.test:9000").unwrap(), true);
	let via = router.select("http://127.0.0.1:10000/v", "127.0.0.1").await.unwrap();
	assert!(via.is_some());
}

#[tokio::test]
async fn socks_upstream_is_rejected_at_selection() {
	let router = upstream("socks5://up.test:1080");
	let err = router
		.select("http://example.test/", "example.test")
		.await
		.unwrap_err();
	assert_matches!(err, ProxyError::Selector(_));
}

async fn pac_router(script: &str) -> Router {
	let evaluator = PacEvaluator::new(&PacSource::Inline(script.to_string()), &[])
		.await
		.unwrap();
	Router::pac(evaluator, false)
}

#[tokio::test]
async fn pac_first_candidate_wins() {
	let router = pac_router(
		r#"function FindProxyForURL(url, host) {
			if (host === "direct.test") { return "DIRECT; PROXY never.test:1"; }
			return "PROXY first.test:8080; PROXY second.test:8080";
		}"#,
	)
	.await;

	let via = router.select("http://direct.test/", "direct.test").await.unwrap();
	assert!(via.is_none());

	let via = router
		.select("http://other.test/", "other.test")
		.await
		.unwrap()
		.unwrap();
	assert_eq!(via.url.host_str(), Some("first.test"));
}

#[tokio::test]
async fn pac_empty_result_means_direct() {
	let router =
		pac_router("function FindProxyForURL(url, host) { return null; }").await;
	let via = router.select("http://x.test/", "x.test").await.unwrap();
	assert!(via.is_none());
}

#[tokio::test]
async fn pac_runtime_error_surfaces_as_bad_pac() {
	let router = pac_router(
		r#"function FindProxyForURL(url, host) {
			if (host === "boom.test") { throw new Error("boom"); }
			return "DIRECT";
		}"#,
	)
	.await;
	let err = router.select("http://boom.test/", "boom.test").await.unwrap_err();
	assert_matches!(err, ProxyError::BadPac(_));
}
