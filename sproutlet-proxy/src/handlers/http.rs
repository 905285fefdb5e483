//! HTTP front-end for the timer-service callbacks.
//!
//! An explicit route table, configured at startup and injected wherever it
//! is served, maps the timer service's POST endpoints onto the handlers:
//!
//! - `POST /timers/<AoR>`
//! - `POST /registrations?send-notifications=true|false`
//! - `POST /authentication-timeout`

use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use super::{
    AorTimeoutHandler, AuthTimeoutHandler, DeregistrationHandler, HTTP_BAD_REQUEST,
    HTTP_METHOD_NOT_ALLOWED, HTTP_NOT_FOUND,
};
use crate::{Result, TrailId};

/// The timer-callback route table.
pub struct HttpRouteTable {
    aor_timeout: AorTimeoutHandler,
    deregistration: DeregistrationHandler,
    auth_timeout: AuthTimeoutHandler,
}

impl HttpRouteTable {
    pub fn new(
        aor_timeout: AorTimeoutHandler,
        deregistration: DeregistrationHandler,
        auth_timeout: AuthTimeoutHandler,
    ) -> HttpRouteTable {
        HttpRouteTable {
            aor_timeout,
            deregistration,
            auth_timeout,
        }
    }

    /// Routes one request to its handler, returning the status code.
    pub async fn dispatch(
        &self,
        method: &str,
        path: &str,
        query: Option<&str>,
        body: &str,
        trail: TrailId,
    ) -> u16 {
        log::debug!("<= {} {} ({:#x})", method, path, trail);
        if method != "POST" {
            return HTTP_METHOD_NOT_ALLOWED;
        }

        if let Some(aor_id) = path.strip_prefix("/timers/") {
            if aor_id.is_empty() {
                return HTTP_BAD_REQUEST;
            }
            self.aor_timeout.handle(aor_id, trail).await
        } else if path == "/registrations" {
            let send_notifications = query_flag(query, "send-notifications").unwrap_or(true);
            self.deregistration
                .handle(body, send_notifications, trail)
                .await
        } else if path == "/authentication-timeout" {
            self.auth_timeout.handle(body, trail).await
        } else {
            HTTP_NOT_FOUND
        }
    }

    /// Serves the route table on a listener until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        log::debug!("timer-callback HTTP server on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let table = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle_connection(table.clone(), req));
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    log::debug!("HTTP connection from {} failed: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    table: Arc<HttpRouteTable>,
    req: hyper::Request<Incoming>,
) -> std::result::Result<hyper::Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let body = String::from_utf8_lossy(&body);

    let trail = crate::new_trail();
    let code = table
        .dispatch(
            parts.method.as_str(),
            parts.uri.path(),
            parts.uri.query(),
            &body,
            trail,
        )
        .await;

    let response = hyper::Response::builder()
        .status(code)
        .body(Full::new(Bytes::new()))
        .expect("response build cannot fail");
    Ok(response)
}

/// Reads a boolean query parameter.
fn query_flag(query: Option<&str>, name: &str) -> Option<bool> {
    let query = query?;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name {
            return match value {
                "true" | "" => Some(true),
                "false" => Some(false),
                _ => None,
            };
        }
    }
    None
}
