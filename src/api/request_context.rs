use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use std::convert::Infallible;
use std::sync::Arc;

use crate::model::{RequestContext, UserContext};
use crate::store::traits::Store;

/// Axum extractor building the per-request context from headers.
///
/// - `X-User-Id`: caller identity; absent means anonymous.
/// - `X-User-Groups`: comma-separated group ids.
/// - `X-User-Role`: `moderator` or `superuser`.
/// - `X-Brand`: brand name the request is scoped to (host-derived by the
///   fronting proxy); unknown brands are ignored with a warning.
///
/// Identity verification itself happens upstream; this service trusts the
/// forwarded headers.
#[async_trait]
impl<S> FromRequestParts<Arc<S>> for RequestContext
where
    S: Store + 'static,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<S>,
    ) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;

        let user = match header_value(headers, "x-user-id") {
            Some(user_id) => {
                let groups = header_value(headers, "x-user-groups")
                    .map(|raw| {
                        raw.split(',')
                            .filter_map(|part| part.trim().parse::<i64>().ok())
                            .collect()
                    })
                    .unwrap_or_default();
                let base = match header_value(headers, "x-user-role").as_deref() {
                    Some("superuser") => UserContext::superuser(&user_id),
                    Some("moderator") => UserContext::moderator(&user_id),
                    _ => UserContext::user(&user_id),
                };
                base.with_groups(groups)
            }
            None => UserContext::anonymous(),
        };

        let brand = match header_value(headers, "x-brand") {
            Some(name) => match state.get_brand_by_name(&name).await {
                Ok(brand) => {
                    if brand.is_none() {
                        log::warn!("request scoped to unknown brand '{}'", name);
                    }
                    brand
                }
                Err(err) => {
                    log::warn!("brand lookup for '{}' failed: {:#}", name, err);
                    None
                }
            },
            None => None,
        };

        Ok(RequestContext::new(user, brand))
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    #[test]
    fn header_values_decode_as_strings() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-user-id"),
            HeaderValue::from_static("alice"),
        );
        headers.insert(
            HeaderName::from_static("x-user-groups"),
            HeaderValue::from_static("3, 7"),
        );

        assert_eq!(header_value(&headers, "x-user-id"), Some("alice".into()));
        assert_eq!(header_value(&headers, "x-user-groups"), Some("3, 7".into()));
        assert_eq!(header_value(&headers, "x-brand"), None);
    }
}
