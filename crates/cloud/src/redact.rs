//! Log-safe rendering of artifact links.

use url::Url;

/// Query parameters that carry credentials in presigned URLs.
const SENSITIVE_PARAMS: &[&str] = &[
    "x-amz-signature",
    "x-amz-credential",
    "x-amz-security-token",
    "signature",
];

/// Strip the query string from presigned URLs so they can be logged.
///
/// Anything that does not parse as a URL (volume paths) or carries no
/// signing parameters is returned unchanged.
pub fn redact_url(link: &str) -> String {
    let Ok(mut url) = Url::parse(link) else {
        return link.to_string();
    };

    let signed = url
        .query_pairs()
        .any(|(k, _)| SENSITIVE_PARAMS.iter().any(|p| k.eq_ignore_ascii_case(p)));

    if !signed {
        return link.to_string();
    }

    url.set_query(None);
    format!("{url}?<redacted>")
}
