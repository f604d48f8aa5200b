use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use mitmcache::{
    api::{self, ApiState},
    browser::{BrowserDriver, CdpBrowser, POLL_INTERVAL, PageRecorder},
    cache::ReplayCache,
    config::{Options, RuntimeContext},
    event_log::EventLog,
    logging::{self, LogFormat},
    proxy,
};

#[derive(Debug, Parser)]
#[command(name = "mitmcache", version, about)]
struct Cli {
    /// Proxy listen address [default: 127.0.0.1:8080].
    #[arg(long)]
    proxy_addr: Option<String>,
    /// Local API base URL [default: http://localhost:3333].
    #[arg(long)]
    rest_addr: Option<String>,
    /// Upstream HTTP proxy URL (example: http://127.0.0.1:8080).
    #[arg(long)]
    upstream: Option<String>,
    /// Browser DevTools WebSocket URL (example: ws://127.0.0.1:9222/devtools/browser/<id>).
    #[arg(long)]
    chromedp: Option<String>,
    /// Regex selecting CONNECT targets to intercept [default: ^.*$].
    #[arg(long)]
    urlmatch: Option<String>,
    /// Regex selecting browser pages to instrument and snapshot [default: ^.*$].
    #[arg(long)]
    pagematch: Option<String>,
    /// Log every request and response passing through the proxy.
    #[arg(short, long)]
    verbose: bool,
    /// Output root for `cache/`, `page/`, `logs/` and `ca/` [default: /tmp/output].
    #[arg(long)]
    output: Option<PathBuf>,
    /// Optional path to config TOML.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Cli {
    fn options(&self) -> anyhow::Result<Options> {
        let mut options = Options::load(self.config.as_deref())?;
        apply_cli_overrides(&mut options, self);
        Ok(options)
    }
}

fn apply_cli_overrides(options: &mut Options, cli: &Cli) {
    if let Some(proxy_addr) = &cli.proxy_addr {
        options.proxy_addr = proxy_addr.clone();
    }
    if let Some(rest_addr) = &cli.rest_addr {
        options.rest_addr = rest_addr.clone();
    }
    if let Some(upstream) = &cli.upstream {
        options.upstream_proxy_url = upstream.clone();
    }
    if let Some(chromedp) = &cli.chromedp {
        options.control_url = chromedp.clone();
    }
    if let Some(urlmatch) = &cli.urlmatch {
        options.urlmatch = urlmatch.clone();
    }
    if let Some(pagematch) = &cli.pagematch {
        options.pagematch = pagematch.clone();
    }
    if cli.verbose {
        options.verbose = true;
    }
    if let Some(output) = &cli.output {
        options.output_path = output.clone();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let options = cli.options()?;
    let ctx = RuntimeContext::new(options)?;

    logging::init(ctx.options().verbose, cli.log_level.as_deref(), cli.log_format)?;
    ctx.ensure_output_dirs()?;
    tracing::info!(config = ?ctx.options(), "config");

    let events = EventLog::open(&ctx.logs_path())?;

    let recorder = match ctx.control_url() {
        Some(control_url) => {
            let driver: Arc<dyn BrowserDriver> = Arc::new(CdpBrowser::connect(control_url).await?);
            let recorder = Arc::new(PageRecorder::new(driver, &ctx));
            recorder.instrument().await?;
            Some(recorder)
        }
        None => {
            tracing::warn!("no --chromedp control URL given, browser features disabled");
            None
        }
    };
    let poller = recorder
        .as_ref()
        .map(|recorder| Arc::clone(recorder).spawn_poller(POLL_INTERVAL));

    let proxy = proxy::serve(&ctx, ReplayCache::file(ctx.cache_path())).await?;
    let api = api::serve(&ctx, ApiState::new(ctx.options().clone(), recorder, events)).await?;
    eprintln!("{}", startup_summary(&ctx, proxy.listen_addr, api.listen_addr));

    tokio::signal::ctrl_c().await?;
    if let Some(poller) = poller {
        poller.abort();
    }
    api.shutdown().await;
    proxy.shutdown().await;

    Ok(())
}

fn startup_summary(
    ctx: &RuntimeContext,
    proxy_listen_addr: SocketAddr,
    api_listen_addr: SocketAddr,
) -> String {
    format!(
        "startup config: proxy_listen={}, api_listen={}, upstream={}, browser={}, output={}",
        proxy_listen_addr,
        api_listen_addr,
        ctx.upstream_proxy_url().unwrap_or("direct"),
        if ctx.control_url().is_some() {
            "connected"
        } else {
            "disabled"
        },
        ctx.output_path().display(),
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use mitmcache::{
        config::{Options, RuntimeContext},
        logging::LogFormat,
    };

    use super::{Cli, apply_cli_overrides, startup_summary};

    #[test]
    fn parses_without_flags_to_defaults() {
        let cli = Cli::try_parse_from(["mitmcache"]).expect("cli parse should succeed");
        assert_eq!(cli.config, None);
        assert_eq!(cli.log_level, None);
        assert_eq!(cli.log_format, LogFormat::Pretty);
        assert_eq!(cli.options().unwrap(), Options::default());
    }

    #[test]
    fn parses_all_documented_flags() {
        let cli = Cli::try_parse_from([
            "mitmcache",
            "--proxy-addr",
            "127.0.0.1:9090",
            "--rest-addr",
            "http://localhost:4444",
            "--upstream",
            "http://127.0.0.1:3128",
            "--chromedp",
            "ws://127.0.0.1:9222/devtools/browser/abc",
            "--urlmatch",
            "example\\.test",
            "--pagematch",
            "app\\.test",
            "-v",
            "--output",
            "/tmp/mitm",
            "--log-format",
            "json",
        ])
        .expect("cli parse should succeed");

        let options = cli.options().unwrap();
        assert_eq!(options.proxy_addr, "127.0.0.1:9090");
        assert_eq!(options.rest_addr, "http://localhost:4444");
        assert_eq!(options.upstream_proxy_url, "http://127.0.0.1:3128");
        assert_eq!(options.control_url, "ws://127.0.0.1:9222/devtools/browser/abc");
        assert_eq!(options.urlmatch, "example\\.test");
        assert_eq!(options.pagematch, "app\\.test");
        assert!(options.verbose);
        assert_eq!(options.output_path, PathBuf::from("/tmp/mitm"));
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn explicit_flags_override_config_file_values() {
        let mut options = Options::from_toml_str(
            r#"
proxy_addr = "0.0.0.0:1111"
rest_addr = "http://localhost:2222"
"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from(["mitmcache", "--proxy-addr", "127.0.0.1:3333"]).unwrap();

        apply_cli_overrides(&mut options, &cli);

        assert_eq!(options.proxy_addr, "127.0.0.1:3333");
        assert_eq!(options.rest_addr, "http://localhost:2222");
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["mitmcache", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn startup_summary_reports_disabled_browser_and_direct_upstream() {
        let ctx = RuntimeContext::new(Options::default()).unwrap();
        let summary = startup_summary(
            &ctx,
            "127.0.0.1:8080".parse().unwrap(),
            "127.0.0.1:3333".parse().unwrap(),
        );
        assert!(summary.contains("proxy_listen=127.0.0.1:8080"), "summary: {summary}");
        assert!(summary.contains("upstream=direct"), "summary: {summary}");
        assert!(summary.contains("browser=disabled"), "summary: {summary}");
    }
}
