//! `CONNECT` targets, the MITM decision and raw byte relaying.

use std::fmt;

use anyhow::Context as _;
use hyper::{
    Uri,
    http::uri::{Authority, InvalidUri},
    upgrade::OnUpgrade,
};
use hyper_util::rt::TokioIo;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite};

const DEFAULT_TLS_PORT: u16 = 443;

/// The `host[:port]` of a `CONNECT` request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    authority: Authority,
}

impl ConnectTarget {
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        uri.authority().cloned().map(|authority| Self { authority })
    }

    pub fn host(&self) -> &str {
        self.authority.host()
    }

    /// `host:port` to dial, with port 443 when the request line names none.
    pub fn dial_addr(&self) -> String {
        let port = self.authority.port_u16().unwrap_or(DEFAULT_TLS_PORT);
        format!("{}:{port}", self.authority.host())
    }

    /// Whether `url_match` selects this tunnel for decryption.
    ///
    /// The pattern is tried against both `host:port` and `https://host:port/`.
    pub fn is_intercepted_by(&self, url_match: Option<&Regex>) -> bool {
        let Some(url_match) = url_match else {
            return false;
        };
        let addr = self.dial_addr();
        url_match.is_match(&addr) || url_match.is_match(&format!("https://{addr}/"))
    }

    /// Absolute URL for a request read inside the decrypted tunnel.
    ///
    /// Origin-form targets become `https://<authority><path>` with the authority exactly as it
    /// appeared on the `CONNECT` line, so `:443` stays part of the URL and of the cache key.
    pub fn request_url(&self, target: &Uri) -> Result<Uri, TunnelTargetError> {
        match (target.scheme_str(), target.authority()) {
            (Some("http" | "https"), Some(_)) => return Ok(target.clone()),
            (Some(scheme), Some(_)) => return Err(TunnelTargetError::Scheme(scheme.to_owned())),
            (Some(_), None) | (None, Some(_)) => return Err(TunnelTargetError::PartialAbsolute),
            (None, None) => {}
        }
        if target.path() == "*" {
            return Err(TunnelTargetError::Asterisk);
        }

        let path_and_query = target
            .path_and_query()
            .map(|path| path.as_str())
            .filter(|path| !path.is_empty())
            .unwrap_or("/");
        format!("https://{}{path_and_query}", self.authority)
            .parse()
            .map_err(TunnelTargetError::Invalid)
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.authority, f)
    }
}

#[derive(Debug)]
pub enum TunnelTargetError {
    Asterisk,
    PartialAbsolute,
    Scheme(String),
    Invalid(InvalidUri),
}

impl fmt::Display for TunnelTargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asterisk => f.write_str("`*` request target inside a tunnel"),
            Self::PartialAbsolute => f.write_str("request target has a scheme or an authority but not both"),
            Self::Scheme(scheme) => write!(f, "unsupported request target scheme `{scheme}`"),
            Self::Invalid(err) => write!(f, "rebuild tunneled request URL: {err}"),
        }
    }
}

impl std::error::Error for TunnelTargetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Invalid(err) => Some(err),
            _ => None,
        }
    }
}

/// Copies bytes both ways between the upgraded client connection and `upstream` until either
/// side closes.
pub async fn splice<S>(client: OnUpgrade, mut upstream: S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client = TokioIo::new(client.await.context("upgrade client connection")?);
    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream)
        .await
        .context("relay tunnel bytes")?;
    tracing::trace!(sent, received, "tunnel closed");
    Ok(())
}

/// [`splice`] between two upgraded HTTP connections, as after a WebSocket handshake.
pub async fn splice_upgrades(client: OnUpgrade, upstream: OnUpgrade) -> anyhow::Result<()> {
    let upstream = TokioIo::new(upstream.await.context("upgrade upstream connection")?);
    splice(client, upstream).await
}
