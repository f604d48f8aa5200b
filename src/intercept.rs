use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode, body::Body, header};

use crate::{
    cache::ReplayCache,
    csp::disable_csp,
    record::{RequestRecord, ResponseRecord},
    session::{SessionId, SessionTable},
};

/// Result of the request leg.
#[derive(Debug)]
pub enum RequestOutcome {
    /// Cache hit: answer the client with this response, skip upstream and the response leg.
    Respond(Response<Full<Bytes>>),
    /// Cache miss: forward this request upstream and run the response leg on the answer.
    Forward(Request<Full<Bytes>>),
}

/// Result of the response leg.
#[derive(Debug)]
pub enum ResponseOutcome<B> {
    /// Upgrade, redirect or uncorrelated response, handed back untouched.
    PassThrough(Response<B>),
    /// Buffered, rewritten and recorded response.
    Recorded(Response<Full<Bytes>>),
    /// Upstream body could not be read.
    Failed(String),
}

/// Paired request/response legs of the recording pipeline.
///
/// For one session id the request leg must finish before the response leg starts.
#[derive(Debug, Clone)]
pub struct Interceptor {
    cache: ReplayCache,
    sessions: Arc<SessionTable>,
}

impl Interceptor {
    pub fn new(cache: ReplayCache) -> Self {
        Self {
            cache,
            sessions: Arc::new(SessionTable::new()),
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub async fn on_request<B>(&self, id: SessionId, req: Request<B>) -> RequestOutcome
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let record = Arc::new(RequestRecord::capture(req).await);
        tracing::debug!("[{id}] --> {} {}", record.method(), record.url());
        self.sessions.store(id, record.clone());

        if let Some(cached) = self.cache.load(&record).await {
            let cached = cached.with_origin(Arc::clone(&record));
            match cached.to_live_response() {
                Ok(mut response) => {
                    disable_csp(response.headers_mut());
                    tracing::debug!(
                        "[{id}] <-- {} {} (cached {})",
                        cached.status(),
                        record.url(),
                        record.fingerprint()
                    );
                    return RequestOutcome::Respond(response);
                }
                Err(err) => {
                    tracing::warn!(
                        key = %record.fingerprint(),
                        "ignoring cached response with invalid status: {err}"
                    );
                }
            }
        }

        RequestOutcome::Forward(record.to_request())
    }

    pub async fn on_response<B>(&self, id: SessionId, resp: Response<B>) -> ResponseOutcome<B>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let status = resp.status();
        let origin = self.sessions.load(id);
        let url = origin
            .as_ref()
            .map(|record| record.url())
            .unwrap_or_default();
        tracing::debug!("[{id}] <-- {} {url}", status.as_u16());

        if status == StatusCode::SWITCHING_PROTOCOLS || status.is_redirection() {
            if let Some(location) = resp.headers().get(header::LOCATION) {
                tracing::debug!("[{id}] Location: {}", String::from_utf8_lossy(location.as_bytes()));
            }
            return ResponseOutcome::PassThrough(resp);
        }

        let Some(origin) = origin else {
            tracing::debug!("[{id}] no request recorded for session, passing response through");
            return ResponseOutcome::PassThrough(resp);
        };

        let record = match ResponseRecord::capture(resp).await {
            Ok(record) => record.with_origin(Arc::clone(&origin)),
            Err(err) => {
                tracing::error!(url = %url, "can't read response body: {err}");
                return ResponseOutcome::Failed(format!("read upstream response body: {err}"));
            }
        };

        let mut live = match record.to_live_response() {
            Ok(live) => live,
            Err(err) => return ResponseOutcome::Failed(err.to_string()),
        };
        disable_csp(live.headers_mut());

        if let Err(err) = self.cache.store(&origin, &record).await {
            tracing::error!(
                key = %origin.fingerprint(),
                url = %url,
                "failed to store response, forwarding unrecorded: {err}"
            );
        }

        ResponseOutcome::Recorded(live)
    }
}
