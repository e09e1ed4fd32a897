//! Routes `/<script>/<rest...>` requests into the bridge

use super::with_state;
use crate::bridge::BridgeRequest;
use crate::error::BridgeError;
use crate::state::AppState;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::sync::Arc;
use warp::http::{HeaderMap, Method};
use warp::path::FullPath;
use warp::{Filter, Rejection, Reply};

pub fn route(
    state: Arc<AppState>,
) -> impl Filter<Extract = (warp::reply::Response,), Error = Rejection> + Clone {
    warp::path::full()
        .and(warp::method())
        .and(warp::header::headers_cloned())
        .and(
            warp::query::raw()
                .or(warp::any().map(String::new))
                .unify(),
        )
        .and(warp::body::bytes())
        .and(with_state(state))
        .and_then(dispatch)
}

async fn dispatch(
    path: FullPath,
    method: Method,
    headers: HeaderMap,
    raw_query: String,
    body: Bytes,
    state: Arc<AppState>,
) -> Result<warp::reply::Response, Rejection> {
    let (name, sub_path) = split_path(path.as_str());

    let request = BridgeRequest::new(header_map(&headers), query_map(&raw_query), body)
        .with_route(&sub_path, method.as_str());

    match state.bridge.invoke(&name, request).await {
        Ok(frame) => Ok(frame.into_response()),
        Err(e) => Ok(error_reply(&e)),
    }
}

/// The plain-text reply for a request the script never answered.
pub fn error_reply(err: &BridgeError) -> warp::reply::Response {
    warp::reply::with_status(err.to_string(), err.status_code()).into_response()
}

/// Split `/name/rest/of/path` into the script name and `rest/of/path`,
/// both percent-decoded.
///
/// The split happens on the raw path, so an encoded `/` stays inside the
/// name and the resolver rejects it.
pub fn split_path(path: &str) -> (String, String) {
    let path = path.strip_prefix('/').unwrap_or(path);
    let (name, rest) = path.split_once('/').unwrap_or((path, ""));
    (decode_segment(name), decode_segment(rest))
}

fn decode_segment(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Header names come lowercased from the HTTP layer; first value wins.
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// Decoded query parameters with lowercased keys; first value wins.
fn query_map(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        map.entry(key.to_lowercase())
            .or_insert_with(|| value.into_owned());
    }
    map
}
