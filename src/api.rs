use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Body,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    browser::{PageInfo, PageRecorder},
    config::{Options, RuntimeContext},
    event_log::{EventData, EventLog},
};

const CORS_ALLOW_HEADERS: &str = "Content-Type, Content-Length, Accept-Encoding, X-CSRF-Token, Authorization, accept, origin, Cache-Control, X-Requested-With";
const CORS_ALLOW_METHODS: &str = "POST, OPTIONS, GET, PUT";
const CORS_MAX_AGE: &str = "86400";
const BROWSER_NOT_CONNECTED: &str = "browser is not connected";

#[derive(Debug)]
pub struct ApiHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ApiHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

/// Shared state behind the local REST API.
pub struct ApiState {
    options: Options,
    recorder: Option<Arc<PageRecorder>>,
    events: EventLog,
}

impl ApiState {
    pub fn new(options: Options, recorder: Option<Arc<PageRecorder>>, events: EventLog) -> Self {
        Self {
            options,
            recorder,
            events,
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct InfoPagesResponse {
    result: Vec<PageInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NavigatePageRequest {
    url: String,
    target_id: String,
    #[serde(default)]
    wait_sec: u64,
}

/// Binds the API on the host:port of `rest_addr`.
pub async fn serve(ctx: &RuntimeContext, state: ApiState) -> anyhow::Result<ApiHandle> {
    let listen_addr = ctx.rest_listen_addr()?;
    serve_on(&listen_addr, state).await
}

pub async fn serve_on(addr: &str, state: ApiState) -> anyhow::Result<ApiHandle> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind API listener {addr}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get API local_addr: {err}"))?;

    let state = Arc::new(state);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| api_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("API connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    tracing::info!(%listen_addr, "API listening");
    Ok(ApiHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

pub async fn api_handler<B>(
    req: Request<B>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let mut response = route(req, state.as_ref()).await;
    apply_cors_headers(&mut response);
    Ok(response)
}

async fn route<B>(req: Request<B>, state: &ApiState) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    tracing::debug!(%method, %path, "API request");

    if method == Method::OPTIONS {
        return empty_response(StatusCode::NO_CONTENT);
    }

    match (method, path.as_str()) {
        (Method::GET, "/config") => api_json_response(StatusCode::OK, &state.options),
        (Method::GET, "/infoPages") => info_pages(state).await,
        (Method::GET, "/reloadPage") => reload_page(state).await,
        (Method::POST, "/navigatePage") => {
            let request = match read_json::<NavigatePageRequest, B>(req).await {
                Ok(request) => request,
                Err(response) => return response,
            };
            navigate_page(state, request).await
        }
        (Method::POST, "/log") => {
            let data = match read_json::<EventData, B>(req).await {
                Ok(data) => data,
                Err(response) => return response,
            };
            match state.events.append(data).await {
                Ok(()) => api_json_response(StatusCode::OK, &json!({})),
                Err(err) => {
                    tracing::error!("append event: {err:#}");
                    api_error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
                }
            }
        }
        (Method::GET, "/swagger/doc.json") => {
            api_json_response(StatusCode::OK, &openapi_document(&state.options.rest_addr))
        }
        (Method::GET, path) if path.starts_with("/swagger/") || path == "/swagger" => {
            swagger_ui_response(&state.options.rest_addr)
        }
        _ => api_error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn info_pages(state: &ApiState) -> Response<Full<Bytes>> {
    let Some(recorder) = state.recorder.as_ref() else {
        return api_error_response(StatusCode::INTERNAL_SERVER_ERROR, BROWSER_NOT_CONNECTED);
    };
    match recorder.driver().pages().await {
        Ok(result) => api_json_response(StatusCode::OK, &InfoPagesResponse { result }),
        Err(err) => api_error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

async fn reload_page(state: &ApiState) -> Response<Full<Bytes>> {
    let Some(recorder) = state.recorder.as_ref() else {
        return api_error_response(StatusCode::INTERNAL_SERVER_ERROR, BROWSER_NOT_CONNECTED);
    };
    match recorder.reload_matching().await {
        Ok(()) => api_json_response(StatusCode::OK, &json!({})),
        Err(err) => {
            tracing::error!("reload pages: {err:#}");
            api_error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
        }
    }
}

async fn navigate_page(state: &ApiState, request: NavigatePageRequest) -> Response<Full<Bytes>> {
    let Some(recorder) = state.recorder.as_ref() else {
        return api_error_response(StatusCode::INTERNAL_SERVER_ERROR, BROWSER_NOT_CONNECTED);
    };
    let wait = Duration::from_secs(request.wait_sec);
    match recorder
        .navigate(&request.target_id, &request.url, wait)
        .await
    {
        Ok(_) => api_json_response(StatusCode::OK, &json!({})),
        Err(err) => {
            tracing::error!(target_id = %request.target_id, "navigate: {err:#}");
            api_error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn read_json<T, B>(req: Request<B>) -> Result<T, Response<Full<Bytes>>>
where
    T: for<'de> Deserialize<'de>,
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let body = req.into_body().collect().await.map_err(|err| {
        api_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to read request body: {err}"),
        )
    })?;
    serde_json::from_slice(&body.to_bytes()).map_err(|err| {
        api_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("invalid JSON body: {err}"),
        )
    })
}

fn apply_cors_headers(response: &mut Response<Full<Bytes>>) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(CORS_MAX_AGE),
    );
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn api_error_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let payload = ApiErrorResponse {
        error: message.into(),
    };
    match serde_json::to_vec(&payload) {
        Ok(body) => json_body_response(status, body),
        Err(err) => {
            tracing::debug!("failed to serialize API error response: {err}");
            let mut response = Response::new(Full::new(Bytes::from_static(
                b"failed to serialize API error response",
            )));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn api_json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(payload) {
        Ok(body) => json_body_response(status, body),
        Err(err) => {
            tracing::debug!("failed to serialize API JSON response: {err}");
            api_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to serialize API response",
            )
        }
    }
}

fn json_body_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn swagger_ui_response(rest_addr: &str) -> Response<Full<Bytes>> {
    let html = format!(
        r##"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>mitmcache API</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css">
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.ui = SwaggerUIBundle({{ url: "{rest_addr}/swagger/doc.json", dom_id: "#swagger-ui" }});
  </script>
</body>
</html>
"##
    );
    let mut response = Response::new(Full::new(Bytes::from(html)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

fn openapi_document(rest_addr: &str) -> serde_json::Value {
    let ok = json!({
        "200": {"description": "OK", "content": {"application/json": {"schema": {"type": "object"}}}},
        "500": {"description": "Error", "content": {"application/json": {"schema": {"$ref": "#/components/schemas/Error"}}}}
    });
    json!({
        "openapi": "3.0.3",
        "info": {"title": "mitmcache API", "version": env!("CARGO_PKG_VERSION")},
        "servers": [{"url": rest_addr}],
        "paths": {
            "/config": {"get": {"summary": "Current options", "responses": ok}},
            "/infoPages": {"get": {"summary": "Open browser pages", "responses": {
                "200": {"description": "OK", "content": {"application/json": {"schema": {
                    "type": "object",
                    "properties": {"result": {"type": "array", "items": {"$ref": "#/components/schemas/PageInfo"}}}
                }}}},
                "500": ok["500"].clone()
            }}},
            "/reloadPage": {"get": {"summary": "Reload and snapshot matching pages", "responses": ok}},
            "/navigatePage": {"post": {
                "summary": "Navigate a page and snapshot it",
                "requestBody": {"required": true, "content": {"application/json": {"schema": {
                    "type": "object",
                    "required": ["url", "targetId"],
                    "properties": {
                        "url": {"type": "string"},
                        "targetId": {"type": "string"},
                        "waitSec": {"type": "integer", "minimum": 0}
                    }
                }}}},
                "responses": ok
            }},
            "/log": {"post": {
                "summary": "Append a client event to the event log",
                "requestBody": {"required": true, "content": {"application/json": {"schema": {
                    "type": "object",
                    "required": ["Type"],
                    "properties": {"Type": {"type": "string"}, "Params": {}}
                }}}},
                "responses": ok
            }}
        },
        "components": {"schemas": {
            "Error": {"type": "object", "properties": {"error": {"type": "string"}}},
            "PageInfo": {"type": "object", "properties": {
                "targetId": {"type": "string"},
                "type": {"type": "string"},
                "title": {"type": "string"},
                "url": {"type": "string"},
                "attached": {"type": "boolean"}
            }}
        }}
    })
}
