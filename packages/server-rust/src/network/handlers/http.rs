//! Fallback handler that dispatches HTTP requests into the application.
//!
//! Query values arrive as strings, bodies must be JSON, and the
//! `Authorization` header becomes the invocation's credential. CORS is
//! applied per route from the route's policy.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use switchyard_core::{Credentials, DispatchError, Inputs};

use super::{AppState, ErrorResponse};
use crate::service::{CorsPolicy, HttpRequest, Preflight, Reply};

/// Resolve and run any request the explicit routes did not claim.
pub async fn dispatch_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _in_flight = state.shutdown.in_flight_guard();
    let path = uri.path();
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let label = format!("{method} {path}");

    // Without a CORS policy, OPTIONS resolves like any other method.
    if method == Method::OPTIONS {
        if let Some(preflight) = state.app.preflight(path) {
            return preflight_response(&preflight, origin, &headers);
        }
    }

    let route = match state.app.route(&method, path) {
        Ok(route) => route,
        Err(err) => return ErrorResponse(state.app.surface(&label, err)).into_response(),
    };
    let cors = route.cors.clone();

    let mut response = match read_request(method, &uri, &headers, &body) {
        Ok(request) => match state.app.invoke_route(route, request).await {
            Ok(Reply::Body(body)) => Json(body).into_response(),
            Ok(Reply::NoContent) => StatusCode::NO_CONTENT.into_response(),
            Err(err) => ErrorResponse(err).into_response(),
        },
        Err(err) => ErrorResponse(state.app.surface(&label, err)).into_response(),
    };

    if let Some(policy) = cors {
        apply_cors(response.headers_mut(), &policy, origin);
    }
    response
}

fn read_request(
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<HttpRequest, DispatchError> {
    let Query(query) = Query::<HashMap<String, String>>::try_from_uri(uri).map_err(|err| {
        DispatchError::bad_request(format!("Invalid query string: {}", err.body_text()))
    })?;
    let query: Inputs = query
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();

    let credentials = headers
        .get(header::AUTHORIZATION)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| {
                    DispatchError::Unauthorized("Authorization header is malformed".to_string())
                })
                .and_then(Credentials::parse)
        })
        .transpose()?;

    let body = read_body(&method, headers, body)?;

    Ok(HttpRequest {
        path: uri.path().to_string(),
        method,
        query,
        body,
        credentials,
    })
}

fn read_body(
    method: &Method,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Option<Value>, DispatchError> {
    let carries_body = matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if body.is_empty() || !carries_body {
        return Ok(None);
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !is_json(content_type) {
        let message = if content_type.is_empty() {
            "Request body has no content type, expected application/json".to_string()
        } else {
            format!("Content type {content_type} is not supported, expected application/json")
        };
        return Err(DispatchError::UnsupportedMediaType(message));
    }

    serde_json::from_slice(body)
        .map(Some)
        .map_err(|err| DispatchError::bad_request(format!("Request body is not valid JSON: {err}")))
}

fn is_json(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json"
        || (essence.starts_with("application/") && essence.ends_with("+json"))
}

/// Add the allow-origin headers for `origin`. Returns whether it was allowed.
fn apply_cors(headers: &mut HeaderMap, policy: &CorsPolicy, origin: Option<&str>) -> bool {
    let Some(allowed) = policy.allow_origin(origin) else {
        return false;
    };
    let Ok(value) = HeaderValue::from_str(&allowed) else {
        return false;
    };
    if allowed != "*" {
        headers.append(header::VARY, HeaderValue::from_static("origin"));
    }
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    if policy.allow_credentials {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    true
}

fn preflight_response(preflight: &Preflight, origin: Option<&str>, request: &HeaderMap) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    if !apply_cors(headers, &preflight.policy, origin) {
        return response;
    }

    let methods = preflight
        .methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if let Ok(value) = HeaderValue::from_str(&methods) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
    }
    let allow_headers = request
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("authorization, content-type"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
    if let Some(max_age) = preflight.policy.max_age {
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from(max_age.as_secs()),
        );
    }
    response
}
