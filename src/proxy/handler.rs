//! Request handlers for the dispatch and admin endpoints.

use axum::{
    extract::{ConnectInfo, Form, Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::Error;
use crate::metrics::{observe_admin, observe_dispatch};
use crate::proxy::server::AppState;

/// Dispatch a request: resolve the client's zone, pick a backend and answer
/// with a redirect pointing at it.
///
/// The client address comes from the `X-Addr` header when present, else from
/// the connection peer. `X-Query-Zone: yes` turns the call into a zone probe
/// that answers 200 with the zone name instead of redirecting.
pub async fn handle_dispatch(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();

    let clip = match headers.get("x-addr").and_then(|v| v.to_str().ok()) {
        Some(addr) => addr.to_string(),
        None => peer.ip().to_string(),
    };

    if headers.get("x-query-zone").and_then(|v| v.to_str().ok()) == Some("yes") {
        let zone = state.dispatcher.query_zone(&clip);
        observe_dispatch("zone_probe", start.elapsed().as_secs_f64());
        return zone.into_response();
    }

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let path = uri.path();

    match state.dispatcher.query(&clip, host, path) {
        Ok(out) => {
            observe_dispatch("redirect", start.elapsed().as_secs_f64());
            let location = format!("http://{}{}", out.server_ip, path);
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        Err(err) => {
            let outcome = match &err {
                Error::UnknownHost(_) => "unknown_host",
                Error::InvalidClientIp(_) => "invalid_ip",
                _ => "no_backend",
            };
            warn!(clip = %clip, host, outcome, "dispatch failed: {}", err);
            observe_dispatch(outcome, start.elapsed().as_secs_f64());
            err.into_response()
        }
    }
}

/// Live reconfiguration: `POST /ipdadmin/set` with form fields `host`,
/// `object` and one or more `value` records.
pub async fn handle_admin_set(
    State(state): State<AppState>,
    Form(fields): Form<Vec<(String, String)>>,
) -> Response {
    let mut host: Option<String> = None;
    let mut object: Option<String> = None;
    let mut values = Vec::new();
    for (key, value) in fields {
        // Only `value` may repeat; for `host` and `object` the first
        // occurrence wins.
        match key.as_str() {
            "host" if host.is_none() => host = Some(value),
            "object" if object.is_none() => object = Some(value),
            "value" => values.push(value),
            _ => {}
        }
    }
    let host = host.unwrap_or_default();
    let object = object.unwrap_or_default();

    match state.dispatcher.set(&host, &object, &values) {
        Ok(()) => {
            debug!(host = %host, object = %object, records = values.len(), "admin set applied");
            observe_admin("set", true);
            StatusCode::OK.into_response()
        }
        Err(err) => {
            warn!(host = %host, object = %object, "admin set rejected: {}", err);
            observe_admin("set", false);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GetParams {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub last: String,
}

/// Counter retrieval: `GET /ipdadmin/get?host=..&node=..[&last=1]`.
/// The body is the counter in base-32.
pub async fn handle_admin_get(
    State(state): State<AppState>,
    Query(params): Query<GetParams>,
) -> Response {
    let count = state.dispatcher.get_count(&params.host, &params.node, &params.last);
    observe_admin("get", true);
    format_base32(count).into_response()
}

/// Format a counter in base 32, digits `0-9` then `a-v`.
pub fn format_base32(value: u64) -> String {
    const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    let mut rest = value;
    while rest > 0 {
        digits.push(DIGITS[(rest % 32) as usize] as char);
        rest /= 32;
    }
    digits.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base32_formatting() {
        assert_eq!(format_base32(0), "0");
        assert_eq!(format_base32(9), "9");
        assert_eq!(format_base32(10), "a");
        assert_eq!(format_base32(31), "v");
        assert_eq!(format_base32(32), "10");
        assert_eq!(format_base32(1234567), "15lk7");
    }
}
