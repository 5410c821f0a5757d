use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use http::HeaderMap;
use http::header::AUTHORIZATION;
use prism_core::RequestContext;
use secrecy::SecretString;

/// Headers a caller may carry a provider credential in, by SDK
const KEY_HEADERS: [&str; 2] = ["x-api-key", "x-goog-api-key"];

/// Build the [`RequestContext`] every handler receives
pub async fn request_context_middleware(request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();

    let api_key = caller_key(&parts.headers, parts.uri.query()).map(SecretString::from);
    let context = RequestContext {
        parts: parts.clone(),
        api_key,
    };

    let mut request = Request::from_parts(parts, body);
    request.extensions_mut().insert(context);

    next.run(request).await
}

/// Credential from `Authorization: Bearer`, an SDK key header, or Google's `?key=`
fn caller_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    let header_key = || {
        KEY_HEADERS
            .iter()
            .find_map(|name| headers.get(*name).and_then(|value| value.to_str().ok()))
            .map(str::trim)
    };

    let query_key = || {
        query?
            .split('&')
            .find_map(|pair| pair.strip_prefix("key="))
    };

    bearer
        .or_else(header_key)
        .or_else(query_key)
        .filter(|key| !key.is_empty())
        .map(str::to_owned)
}
