use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROXY_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_REST_ADDR: &str = "http://localhost:3333";
pub const DEFAULT_URL_MATCH: &str = "^.*$";
pub const DEFAULT_PAGE_MATCH: &str = "^.*$";
pub const DEFAULT_OUTPUT_PATH: &str = "/tmp/output";

const CACHE_SUBDIR: &str = "cache";
const PAGE_SUBDIR: &str = "page";
const LOGS_SUBDIR: &str = "logs";
const CA_SUBDIR: &str = "ca";
const DIR_MODE_RESTRICTED: u32 = 0o700;

/// Process options, as given on the command line or in a TOML file.
///
/// The serialized form is what `GET /config` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    pub proxy_addr: String,
    pub rest_addr: String,
    pub upstream_proxy_url: String,
    pub control_url: String,
    pub urlmatch: String,
    pub pagematch: String,
    pub verbose: bool,
    pub output_path: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            proxy_addr: DEFAULT_PROXY_ADDR.to_owned(),
            rest_addr: DEFAULT_REST_ADDR.to_owned(),
            upstream_proxy_url: String::new(),
            control_url: String::new(),
            urlmatch: DEFAULT_URL_MATCH.to_owned(),
            pagematch: DEFAULT_PAGE_MATCH.to_owned(),
            verbose: false,
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
        }
    }
}

impl Options {
    /// Loads options from `path` when given, otherwise returns the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }
}

impl FromStr for Options {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

/// Everything the running components need, passed explicitly into each of them.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    options: Options,
    url_match: Option<Regex>,
    page_match: Regex,
}

impl RuntimeContext {
    pub fn new(options: Options) -> anyhow::Result<Self> {
        let url_match = if options.urlmatch.is_empty() {
            None
        } else {
            Some(
                Regex::new(&options.urlmatch)
                    .with_context(|| format!("compile urlmatch `{}`", options.urlmatch))?,
            )
        };
        let page_match = Regex::new(&options.pagematch)
            .with_context(|| format!("compile pagematch `{}`", options.pagematch))?;

        Ok(Self {
            options,
            url_match,
            page_match,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Regex selecting CONNECT targets that are intercepted. `None` tunnels everything.
    pub fn url_match(&self) -> Option<&Regex> {
        self.url_match.as_ref()
    }

    pub fn page_match(&self) -> &Regex {
        &self.page_match
    }

    pub fn upstream_proxy_url(&self) -> Option<&str> {
        let url = self.options.upstream_proxy_url.trim();
        (!url.is_empty()).then_some(url)
    }

    pub fn control_url(&self) -> Option<&str> {
        let url = self.options.control_url.trim();
        (!url.is_empty()).then_some(url)
    }

    pub fn output_path(&self) -> &Path {
        &self.options.output_path
    }

    pub fn cache_path(&self) -> PathBuf {
        self.options.output_path.join(CACHE_SUBDIR)
    }

    pub fn page_path(&self) -> PathBuf {
        self.options.output_path.join(PAGE_SUBDIR)
    }

    pub fn logs_path(&self) -> PathBuf {
        self.options.output_path.join(LOGS_SUBDIR)
    }

    pub fn ca_path(&self) -> PathBuf {
        self.options.output_path.join(CA_SUBDIR)
    }

    /// Creates the output root and its subdirectories when they do not exist yet.
    pub fn ensure_output_dirs(&self) -> anyhow::Result<()> {
        for dir in [
            self.output_path().to_path_buf(),
            self.cache_path(),
            self.page_path(),
            self.logs_path(),
            self.ca_path(),
        ] {
            create_restricted_dir(&dir)?;
        }
        Ok(())
    }

    /// `host:port` the local API binds to, taken from `rest_addr`.
    pub fn rest_listen_addr(&self) -> anyhow::Result<String> {
        rest_listen_addr(&self.options.rest_addr)
    }
}

fn rest_listen_addr(rest_addr: &str) -> anyhow::Result<String> {
    let url = url::Url::parse(rest_addr).with_context(|| format!("parse rest_addr `{rest_addr}`"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("rest_addr `{rest_addr}` has no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow::anyhow!("rest_addr `{rest_addr}` has no port"))?;
    Ok(format!("{host}:{port}"))
}

fn create_restricted_dir(path: &Path) -> anyhow::Result<()> {
    if path.is_dir() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;

        builder.mode(DIR_MODE_RESTRICTED);
    }
    builder
        .create(path)
        .with_context(|| format!("mkdir(\"{}\")", path.display()))
}
