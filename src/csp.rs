use hyper::{
    HeaderMap,
    header::{self, HeaderName, HeaderValue},
};

/// Policy installed on every rewritten response: everything allowed, inline and eval included.
pub const PERMISSIVE_CSP: &str = "default-src *  data: blob: * filesystem: about: ws: wss: 'unsafe-inline' 'unsafe-eval' ; script-src * data: blob: 'unsafe-inline' 'unsafe-eval'; connect-src * data: blob: 'unsafe-inline'; img-src * data: blob: 'unsafe-inline'; frame-src * data: blob: ; style-src * data: blob: 'unsafe-inline'; font-src * data: blob: 'unsafe-inline';";

const X_XSS_PROTECTION: HeaderName = HeaderName::from_static("x-xss-protection");

/// Drops the page's own CSP and XSS-filter headers and installs [`PERMISSIVE_CSP`].
pub fn disable_csp(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_SECURITY_POLICY);
    headers.remove(header::CONTENT_SECURITY_POLICY_REPORT_ONLY);
    headers.remove(X_XSS_PROTECTION);
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(PERMISSIVE_CSP),
    );
}
