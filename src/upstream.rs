use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use anyhow::Context as _;
use hyper::Uri;
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
};

const MAX_CONNECT_RESPONSE_HEAD_BYTES: usize = 16 * 1024;

/// Opens TCP connections to origin servers, directly or through an upstream HTTP proxy's
/// `CONNECT` method.
#[derive(Debug, Clone, Default)]
pub struct UpstreamConnector {
    proxy_addr: Option<String>,
}

impl UpstreamConnector {
    pub fn direct() -> Self {
        Self::default()
    }

    /// Routes every connection through the proxy at `proxy_url` (`http://host:port`).
    pub fn via_proxy(proxy_url: &str) -> anyhow::Result<Self> {
        let url = url::Url::parse(proxy_url)
            .with_context(|| format!("parse upstream proxy URL `{proxy_url}`"))?;
        if url.scheme() != "http" {
            anyhow::bail!("upstream proxy URL `{proxy_url}` must use the http scheme");
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("upstream proxy URL `{proxy_url}` has no host"))?;
        let port = url.port_or_known_default().unwrap_or(80);
        Ok(Self {
            proxy_addr: Some(format!("{host}:{port}")),
        })
    }

    pub fn from_optional_proxy(proxy_url: Option<&str>) -> anyhow::Result<Self> {
        match proxy_url {
            Some(proxy_url) => Self::via_proxy(proxy_url),
            None => Ok(Self::direct()),
        }
    }

    pub fn proxy_addr(&self) -> Option<&str> {
        self.proxy_addr.as_deref()
    }

    /// Connects to `target` (`host:port`).
    pub async fn dial(&self, target: &str) -> io::Result<TcpStream> {
        let stream = match self.proxy_addr.as_deref() {
            Some(proxy_addr) => {
                let mut stream = TcpStream::connect(proxy_addr).await?;
                establish_connect_tunnel(&mut stream, target).await?;
                stream
            }
            None => TcpStream::connect(target).await?,
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

impl tower_service::Service<Uri> for UpstreamConnector {
    type Response = TokioIo<TcpStream>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            let target = dial_target_for_uri(&dst)?;
            connector.dial(&target).await.map(TokioIo::new)
        })
    }
}

/// `host:port` for an absolute URI, defaulting the port from the scheme.
pub fn dial_target_for_uri(uri: &Uri) -> io::Result<String> {
    let host = uri.host().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("URI `{uri}` has no host"))
    })?;
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") | Some("wss") => 443,
        _ => 80,
    });
    if host.contains(':') && !host.starts_with('[') {
        Ok(format!("[{host}]:{port}"))
    } else {
        Ok(format!("{host}:{port}"))
    }
}

async fn establish_connect_tunnel(stream: &mut TcpStream, target: &str) -> io::Result<()> {
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let head = read_response_head(stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("upstream proxy refused CONNECT {target}: {}", status_line.trim()),
        ));
    }
    Ok(())
}

async fn read_response_head(stream: &mut TcpStream) -> io::Result<String> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upstream proxy CONNECT response head too large",
            ));
        }
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream proxy closed connection during CONNECT",
            ));
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}
