//! axum middleware enforcing [`Resolver`] decisions
//!
//! Granted requests continue down the stack with attribution headers and
//! configured credentials added; everything else is answered here.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use http::request::Parts;
use permit_core::{AccessRequest, Decision, Resolver};

/// Transport details set by the listener as a request extension.
///
/// Without it the remote address falls back to axum's
/// `ConnectInfo<SocketAddr>` and the connection counts as plain text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
	pub remote_addr: Option<SocketAddr>,
	pub tls: bool,
	/// Common name of the verified client certificate
	pub peer_common_name: Option<String>,
}

fn connection_info(parts: &Parts) -> ConnectionInfo {
	if let Some(info) = parts.extensions.get::<ConnectionInfo>() {
		return info.clone();
	}
	ConnectionInfo {
		remote_addr: parts
			.extensions
			.get::<ConnectInfo<SocketAddr>>()
			.map(|ConnectInfo(addr)| *addr),
		..Default::default()
	}
}

/// Build the engine's view of a request.
pub fn access_request(parts: &Parts) -> AccessRequest {
	let uri = parts
		.uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/");
	let conn = connection_info(parts);

	let mut req = AccessRequest::new(parts.method.clone(), uri)
		.with_headers(parts.headers.clone())
		.with_tls(conn.tls);
	if let Some(addr) = conn.remote_addr {
		req = req.with_remote_addr(addr);
	}
	if let Some(cn) = conn.peer_common_name.filter(|_| conn.tls) {
		req = req.with_peer_common_name(cn);
	}
	req
}

/// Middleware function for [`middleware::from_fn_with_state`].
pub async fn authorize(
	State(resolver): State<Arc<Resolver>>,
	req: Request,
	next: Next,
) -> Response {
	let (mut parts, body) = req.into_parts();
	let decision = resolver.authorize(&access_request(&parts)).await;

	match &decision {
		Decision::Allow { .. } => {
			decision.annotate(&mut parts.headers);
			next.run(Request::from_parts(parts, body)).await
		},
		Decision::Deny { status, reason, .. } => (*status, reason.clone()).into_response(),
		Decision::Challenge(challenge) => {
			let (name, value) = challenge.header();
			(challenge.status(), [(name, value)]).into_response()
		},
	}
}

/// Put every route of `router` behind `resolver`.
pub fn protect<S>(router: Router<S>, resolver: Arc<Resolver>) -> Router<S>
where
	S: Clone + Send + Sync + 'static,
{
	router.layer(middleware::from_fn_with_state(resolver, authorize))
}

#[cfg(test)]
#[path = "middleware_test.rs"]
mod tests;
