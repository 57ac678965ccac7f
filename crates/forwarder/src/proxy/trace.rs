use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body::Body as _;
use http_body::{Frame, SizeHint};
use http_body_util::BodyExt;
use pin_project_lite::pin_project;

use crate::{Body, BoxError};

pub type WroteResponseHook = Arc<dyn Fn(WroteResponse) + Send + Sync>;

/// Lifecycle hooks. Any hook may be unset. A hook is a plain value held by
/// the proxy; it holds no reference back to it.
#[derive(Clone, Default)]
pub struct ProxyTrace {
	/// Called exactly once per request, after the last byte of the response
	/// has been handed off (or after the first permanent error).
	pub wrote_response: Option<WroteResponseHook>,
}

impl ProxyTrace {
	pub(crate) fn fire_wrote_response(&self, status: StatusCode, error: Option<String>) {
		if let Some(hook) = &self.wrote_response {
			hook(WroteResponse { status, error });
		}
	}
}

impl fmt::Debug for ProxyTrace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ProxyTrace")
			.field("wrote_response", &self.wrote_response.is_some())
			.finish()
	}
}

#[derive(Clone, Debug)]
pub struct WroteResponse {
	pub status: StatusCode,
	pub error: Option<String>,
}

struct TraceCtx {
	trace: ProxyTrace,
	status: StatusCode,
	error: Option<String>,
}

impl TraceCtx {
	fn fire(self, stream_error: Option<String>) {
		let error = self.error.or(stream_error);
		self.trace.fire_wrote_response(self.status, error);
	}
}

/// Wraps a response so the trace hook fires when the body finishes
/// streaming, errors, or is dropped mid-flight. The `Option` guarantees a
/// single firing across all three paths.
pub(crate) fn wrap(resp: Response<Body>, trace: &ProxyTrace, error: Option<String>) -> Response<Body> {
	if trace.wrote_response.is_none() {
		return resp;
	}
	let status = resp.status();
	let trace = trace.clone();
	resp.map(|inner| {
		TraceBody {
			inner,
			ctx: Some(TraceCtx { trace, status, error }),
		}
		.boxed()
	})
}

pin_project! {
	struct TraceBody {
		#[pin]
		inner: Body,
		ctx: Option<TraceCtx>,
	}

	impl PinnedDrop for TraceBody {
		fn drop(this: Pin<&mut Self>) {
			let this = this.project();
			if let Some(ctx) = this.ctx.take() {
				ctx.fire(Some("response body dropped before completion".to_string()));
			}
		}
	}
}

impl http_body::Body for TraceBody {
	type Data = Bytes;
	type Error = BoxError;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		match ready!(this.inner.poll_frame(cx)) {
			Some(Ok(frame)) => Poll::Ready(Some(Ok(frame))),
			Some(Err(e)) => {
				if let Some(ctx) = this.ctx.take() {
					ctx.fire(Some(e.to_string()));
				}
				Poll::Ready(Some(Err(e)))
			},
			None => {
				if let Some(ctx) = this.ctx.take() {
					ctx.fire(None);
				}
				Poll::Ready(None)
			},
		}
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}
