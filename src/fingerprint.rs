/// Number of lowercase hex characters kept from the MD5 digest.
pub const FINGERPRINT_LEN: usize = 10;

/// Computes the cache key of a request.
///
/// The key is the first [`FINGERPRINT_LEN`] hex characters of
/// `md5("<method> <absolute-url> <raw-body-bytes>")`. Headers, peer address and TLS details
/// never take part, so two requests sharing method, URL and body share a key.
pub fn fingerprint(method: &str, url: &str, body: &[u8]) -> String {
    let mut data = Vec::with_capacity(method.len() + url.len() + body.len() + 2);
    data.extend_from_slice(method.as_bytes());
    data.push(b' ');
    data.extend_from_slice(url.as_bytes());
    data.push(b' ');
    data.extend_from_slice(body);

    let mut hex = format!("{:x}", md5::compute(&data));
    hex.truncate(FINGERPRINT_LEN);
    hex
}
