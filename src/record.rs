use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode, Uri, Version,
    body::Body,
    header::{self, HeaderName, HeaderValue},
    http::{request, status::InvalidStatusCode},
};
use serde::{Deserialize, Serialize};

use crate::fingerprint;

/// Header multi-map as written to the `*_req.json` / `*_resp.json` documents.
pub type HeaderDocument = BTreeMap<String, Vec<String>>;

/// Request-target exactly as the client sent it, before the proxy made it absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequestUri(pub String);

/// Response extension linking a rebuilt live response to the request that produced it.
#[derive(Debug, Clone)]
pub struct OriginRequest(pub Arc<RequestRecord>);

/// A captured request with its body fully buffered.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    method: Method,
    uri: Uri,
    version: Version,
    request_uri: String,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "RequestURI")]
    pub request_uri: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Header")]
    pub header: HeaderDocument,
}

impl RequestRecord {
    /// Drains the request body into memory.
    ///
    /// A body that fails to read is recorded as empty so the transaction can still proceed.
    pub async fn capture<B>(req: Request<B>) -> Self
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();
        let body = match drain_body(body).await {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(url = %parts.uri, "can't read request body: {err}");
                Bytes::new()
            }
        };
        Self::from_parts(parts, body)
    }

    pub fn from_parts(parts: request::Parts, body: Bytes) -> Self {
        let request_uri = parts
            .extensions
            .get::<RawRequestUri>()
            .map(|raw| raw.0.clone())
            .unwrap_or_else(|| parts.uri.to_string());
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            request_uri,
            headers: parts.headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Canonical absolute URL used for keying.
    pub fn url(&self) -> String {
        self.uri.to_string()
    }

    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    /// `Host` header value, falling back to the URL authority.
    pub fn host(&self) -> String {
        self.headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .or_else(|| self.uri.authority().map(|authority| authority.to_string()))
            .unwrap_or_default()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn fingerprint(&self) -> String {
        fingerprint::fingerprint(self.method.as_str(), &self.url(), &self.body)
    }

    /// Builds a fresh live request over the buffered body, ready to be forwarded.
    pub fn to_request(&self) -> Request<Full<Bytes>> {
        let mut request = Request::new(Full::new(self.body.clone()));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers.clone();
        request
    }

    pub fn meta(&self) -> RequestMeta {
        RequestMeta {
            method: self.method.to_string(),
            host: self.host(),
            request_uri: self.request_uri.clone(),
            url: self.url(),
            header: headers_to_document(&self.headers),
        }
    }
}

/// A captured or cached response with its body fully buffered.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    origin: Option<Arc<RequestRecord>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(rename = "Status")]
    pub status: u16,
    #[serde(rename = "Header", default)]
    pub header: HeaderDocument,
}

impl ResponseRecord {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status: status.as_u16(),
            headers,
            body: body.into(),
            origin: None,
        }
    }

    /// Drains an upstream response body into memory.
    pub async fn capture<B>(resp: Response<B>) -> Result<Self, B::Error>
    where
        B: Body<Data = Bytes>,
    {
        let (parts, body) = resp.into_parts();
        let body = drain_body(body).await?;
        Ok(Self {
            status: parts.status.as_u16(),
            headers: parts.headers,
            body,
            origin: None,
        })
    }

    pub fn from_meta(meta: ResponseMeta, body: impl Into<Bytes>) -> Self {
        Self {
            status: meta.status,
            headers: headers_from_document(&meta.header),
            body: body.into(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: Arc<RequestRecord>) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn origin(&self) -> Option<&RequestRecord> {
        self.origin.as_deref()
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn meta(&self) -> ResponseMeta {
        ResponseMeta {
            status: self.status,
            header: headers_to_document(&self.headers),
        }
    }

    /// Builds a fresh live response: status and headers copied, `Content-Length` set to the
    /// buffered body length and a new readable body on every call. A linked origin request
    /// travels along as an [`OriginRequest`] extension.
    ///
    /// The reason phrase is the canonical one for the status code.
    pub fn to_live_response(&self) -> Result<Response<Full<Bytes>>, InvalidStatusCode> {
        let status = StatusCode::from_u16(self.status)?;
        let mut response = Response::new(Full::new(self.body.clone()));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        *headers = self.headers.clone();
        headers.remove(header::TRANSFER_ENCODING);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        if let Some(origin) = &self.origin {
            response
                .extensions_mut()
                .insert(OriginRequest(Arc::clone(origin)));
        }
        Ok(response)
    }
}

async fn drain_body<B>(body: B) -> Result<Bytes, B::Error>
where
    B: Body<Data = Bytes>,
{
    let mut body = std::pin::pin!(body);
    let mut buffered = Vec::new();
    let mut buffered_len = 0usize;
    while let Some(frame_result) = body.frame().await {
        let frame = frame_result?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        buffered_len = buffered_len.saturating_add(data.len());
        buffered.push(data);
    }

    Ok(flatten_chunks(buffered, buffered_len))
}

fn flatten_chunks(mut buffered: Vec<Bytes>, buffered_len: usize) -> Bytes {
    if buffered.len() <= 1 {
        return buffered.pop().unwrap_or_default();
    }

    let mut flattened = Vec::with_capacity(buffered_len);
    for chunk in buffered {
        flattened.extend_from_slice(&chunk);
    }
    Bytes::from(flattened)
}

pub fn headers_to_document(headers: &HeaderMap) -> HeaderDocument {
    let mut document = HeaderDocument::new();
    for (name, value) in headers {
        document
            .entry(canonical_header_name(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    document
}

/// Rebuilds a header map; entries that are not valid HTTP header names or values are skipped.
pub fn headers_from_document(document: &HeaderDocument) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in document {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!(header = %name, "skipping invalid stored header name");
            continue;
        };
        for value in values {
            let Ok(value) = HeaderValue::from_str(value) else {
                tracing::debug!(header = %name, "skipping invalid stored header value");
                continue;
            };
            headers.append(name.clone(), value);
        }
    }
    headers
}

/// `content-security-policy` -> `Content-Security-Policy`.
fn canonical_header_name(name: &str) -> String {
    let mut canonical = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            canonical.push(ch.to_ascii_uppercase());
        } else {
            canonical.push(ch.to_ascii_lowercase());
        }
        upper = ch == '-';
    }
    canonical
}
