use std::{convert::Infallible, error::Error as StdError, net::SocketAddr, sync::Arc};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode, Version,
    body::Incoming,
    header::{self, HeaderName},
    service::service_fn,
    upgrade::OnUpgrade,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::Client,
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use regex::Regex;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
};

use crate::{
    ca::LocalCa,
    cache::ReplayCache,
    config::RuntimeContext,
    intercept::{Interceptor, RequestOutcome, ResponseOutcome},
    record::{OriginRequest, RawRequestUri},
    session::{SessionId, SessionIdGenerator},
    tunnel::{self, ConnectTarget},
    upstream::UpstreamConnector,
};

type BoxError = Box<dyn StdError + Send + Sync>;
type ProxyBody = BoxBody<Bytes, BoxError>;
type HttpClient = Client<HttpsConnector<UpstreamConnector>, ProxyBody>;

/// Connection-scoped headers never forwarded across the proxy.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct ProxyState {
    interceptor: Interceptor,
    client: HttpClient,
    connector: UpstreamConnector,
    url_match: Option<Regex>,
    ca: LocalCa,
    session_ids: SessionIdGenerator,
}

/// Binds the proxy listener on `proxy_addr` and starts accepting connections.
///
/// The local root CA under `ca_path()` is created on first start.
pub async fn serve(ctx: &RuntimeContext, cache: ReplayCache) -> anyhow::Result<ProxyHandle> {
    // Fails only when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let ca = LocalCa::load_or_create(&ctx.ca_path())?;
    let connector = UpstreamConnector::from_optional_proxy(ctx.upstream_proxy_url())?;
    let state = Arc::new(ProxyState {
        interceptor: Interceptor::new(cache),
        client: upstream_client(connector.clone()),
        connector,
        url_match: ctx.url_match().cloned(),
        ca,
        session_ids: SessionIdGenerator::default(),
    });

    let proxy_addr = ctx.options().proxy_addr.as_str();
    let listener = TcpListener::bind(proxy_addr)
        .await
        .with_context(|| format!("bind proxy listener {proxy_addr}"))?;
    let listen_addr = listener.local_addr().context("proxy listener address")?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _peer)) => stream,
                    Err(err) => {
                        tracing::debug!("accept failed: {err}");
                        continue;
                    }
                },
            };
            tokio::spawn(serve_client(stream, Arc::clone(&state)));
        }
    });

    tracing::info!(%listen_addr, "proxy listening");
    Ok(ProxyHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

async fn serve_client(stream: TcpStream, state: Arc<ProxyState>) {
    let service = service_fn(move |req| proxy_handler(req, Arc::clone(&state)));
    if let Err(err) = ConnectionBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!("client connection closed: {err}");
    }
}

/// Client for upstream origins, dialing through [`UpstreamConnector`].
fn upstream_client(connector: UpstreamConnector) -> HttpClient {
    let tls = HttpsConnectorBuilder::new()
        .with_native_roots()
        .unwrap_or_else(|err| {
            tracing::warn!("no native root certificates, upstream HTTPS will fail: {err}");
            HttpsConnectorBuilder::new().with_tls_config(
                rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth(),
            )
        })
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(connector);
    Client::builder(TokioExecutor::new()).build(tls)
}

async fn proxy_handler(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<ProxyBody>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(connect_handler(req, state).await);
    }
    if req.uri().scheme().is_none() || req.uri().authority().is_none() {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "proxy requests must use an absolute-form request target",
        ));
    }

    let raw_uri = RawRequestUri(req.uri().to_string());
    req.extensions_mut().insert(raw_uri);
    Ok(intercepted_handler(req, state).await)
}

/// Answers `CONNECT` with 200, then either decrypts the tunnel or relays it untouched.
async fn connect_handler(mut req: Request<Incoming>, state: Arc<ProxyState>) -> Response<ProxyBody> {
    let Some(target) = ConnectTarget::from_uri(req.uri()) else {
        return text_response(
            StatusCode::BAD_REQUEST,
            "CONNECT request target must include authority",
        );
    };
    let client = hyper::upgrade::on(&mut req);

    if target.is_intercepted_by(state.url_match.as_ref()) {
        tokio::spawn(async move {
            if let Err(err) = serve_mitm(target, client, state).await {
                tracing::debug!("MITM session ended: {err:#}");
            }
        });
        return text_response(StatusCode::OK, "");
    }

    let upstream = match state.connector.dial(&target.dial_addr()).await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::debug!(%target, "CONNECT dial failed: {err}");
            return text_response(StatusCode::BAD_GATEWAY, "CONNECT upstream dial failed");
        }
    };
    tokio::spawn(async move {
        if let Err(err) = tunnel::splice(client, upstream).await {
            tracing::debug!(%target, "tunnel ended: {err:#}");
        }
    });
    text_response(StatusCode::OK, "")
}

/// Terminates TLS with a leaf for the CONNECT host and serves the decrypted requests.
async fn serve_mitm(
    target: ConnectTarget,
    client: OnUpgrade,
    state: Arc<ProxyState>,
) -> anyhow::Result<()> {
    let acceptor = state.ca.acceptor_for(target.host())?;
    let client = client.await.context("upgrade CONNECT connection")?;
    let tls = acceptor.accept(TokioIo::new(client)).await.with_context(|| {
        format!(
            "TLS handshake for {target}; the client must trust {}",
            state.ca.cert_path().display()
        )
    })?;

    let target = Arc::new(target);
    let service = service_fn(move |req| {
        tunneled_request_handler(req, Arc::clone(&target), Arc::clone(&state))
    });
    ConnectionBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls), service)
        .await
        .map_err(|err| anyhow::anyhow!("serve decrypted requests: {err}"))
}

async fn tunneled_request_handler(
    mut req: Request<Incoming>,
    target: Arc<ConnectTarget>,
    state: Arc<ProxyState>,
) -> Result<Response<ProxyBody>, Infallible> {
    let url = match target.request_url(req.uri()) {
        Ok(url) => url,
        Err(err) => {
            tracing::debug!(%target, "bad request target inside tunnel: {err}");
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                "invalid HTTPS request target inside CONNECT tunnel",
            ));
        }
    };
    let raw_uri = RawRequestUri(req.uri().to_string());
    req.extensions_mut().insert(raw_uri);
    *req.uri_mut() = url;
    Ok(intercepted_handler(req, state).await)
}

/// Runs one HTTP transaction through the request leg, upstream, and the response leg.
async fn intercepted_handler(mut req: Request<Incoming>, state: Arc<ProxyState>) -> Response<ProxyBody> {
    let session_id = state.session_ids.next_id();
    let client_upgrade = is_websocket_upgrade(&req).then(|| hyper::upgrade::on(&mut req));

    let (mut parts, body) = req.into_parts();
    if client_upgrade.is_some() {
        parts.headers.remove("proxy-connection");
    } else {
        strip_hop_by_hop_headers(&mut parts.headers);
    }

    let forward = match state
        .interceptor
        .on_request(session_id, Request::from_parts(parts, body))
        .await
    {
        RequestOutcome::Respond(response) => {
            trace_cache_outcome(session_id, "replayed", &response);
            return response.map(boxed_full);
        }
        RequestOutcome::Forward(request) => request,
    };

    let mut forward = forward.map(boxed_full);
    *forward.version_mut() = Version::HTTP_11;
    let mut upstream_res = match state.client.request(forward).await {
        Ok(res) => res,
        Err(err) => {
            tracing::debug!("[{session_id}] upstream request failed: {err}");
            return text_response(StatusCode::BAD_GATEWAY, "upstream request failed");
        }
    };

    let switching_protocols = upstream_res.status() == StatusCode::SWITCHING_PROTOCOLS;
    if switching_protocols {
        let upstream_upgrade = hyper::upgrade::on(&mut upstream_res);
        if let Some(client_upgrade) = client_upgrade {
            tokio::spawn(async move {
                if let Err(err) = tunnel::splice_upgrades(client_upgrade, upstream_upgrade).await {
                    tracing::debug!("[{session_id}] websocket relay ended: {err:#}");
                }
            });
        }
    } else {
        strip_hop_by_hop_headers(upstream_res.headers_mut());
    }

    match state.interceptor.on_response(session_id, upstream_res).await {
        ResponseOutcome::PassThrough(response) if switching_protocols => {
            let (mut parts, _body) = response.into_parts();
            parts.headers.remove("proxy-connection");
            Response::from_parts(parts, boxed_full(Full::new(Bytes::new())))
        }
        ResponseOutcome::PassThrough(response) => response.map(boxed_incoming),
        ResponseOutcome::Recorded(response) => {
            trace_cache_outcome(session_id, "recorded", &response);
            response.map(boxed_full)
        }
        ResponseOutcome::Failed(message) => {
            tracing::debug!("[{session_id}] {message}");
            text_response(StatusCode::BAD_GATEWAY, "failed to read upstream response")
        }
    }
}

fn trace_cache_outcome(session_id: SessionId, outcome: &str, response: &Response<Full<Bytes>>) {
    let Some(OriginRequest(origin)) = response.extensions().get::<OriginRequest>() else {
        return;
    };
    tracing::debug!(
        key = %origin.fingerprint(),
        url = %origin.url(),
        status = response.status().as_u16(),
        "[{session_id}] {outcome}"
    );
}

/// Trimmed, non-empty tokens of every `Connection` header.
fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> + '_ {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = connection_tokens(headers)
        .filter_map(|token| HeaderName::from_bytes(token.as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.method() == Method::GET
        && connection_tokens(req.headers()).any(|token| token.eq_ignore_ascii_case("upgrade"))
        && req
            .headers()
            .get(header::UPGRADE)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"websocket"))
}

fn boxed_full(body: Full<Bytes>) -> ProxyBody {
    body.map_err(|never| -> BoxError { match never {} }).boxed()
}

fn boxed_incoming(body: Incoming) -> ProxyBody {
    body.map_err(|err| -> BoxError { Box::new(err) }).boxed()
}

fn text_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(Full::new(Bytes::from_static(message.as_bytes()))));
    *response.status_mut() = status;
    response
}
