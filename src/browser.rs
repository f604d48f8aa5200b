use std::{
    collections::HashSet,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use async_trait::async_trait;
use chromiumoxide::{
    Browser, Page,
    cdp::browser_protocol::{
        network::{EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent},
        page::AddScriptToEvaluateOnNewDocumentParams,
    },
};
use futures::StreamExt as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};

use crate::config::RuntimeContext;

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const INSTRUMENT_RELOAD_WAIT: Duration = Duration::from_secs(2);
/// Upper bound on waiting for in-flight requests to settle after a navigation or reload.
const REQUEST_IDLE_LIMIT: Duration = Duration::from_secs(30);

const BOOTSTRAP_SCRIPT: &str = include_str!("../assets/init.js");
const API_URL_PLACEHOLDER: &str = "{{{ANOTHERPROXY_API_URL}}}";
const INNER_HTML_EXPRESSION: &str = "document.documentElement.innerHTML";

/// One open browser tab as reported by `GET /infoPages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub page_type: String,
    pub title: String,
    pub url: String,
    pub attached: bool,
}

/// The browser operations page recording needs, keyed by DevTools target id.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn pages(&self) -> anyhow::Result<Vec<PageInfo>>;

    /// Loads `url` in the target, then waits until no request has been in flight for `wait`.
    async fn navigate(&self, target_id: &str, url: &str, wait: Duration) -> anyhow::Result<()>;

    /// Reloads the target, then waits until no request has been in flight for `wait`.
    async fn reload(&self, target_id: &str, wait: Duration) -> anyhow::Result<()>;

    /// Registers `script` to run before any page script on every new document of the target.
    async fn inject_on_new_document(&self, target_id: &str, script: &str) -> anyhow::Result<()>;

    async fn inner_html(&self, target_id: &str) -> anyhow::Result<String>;
}

/// DevTools-protocol driver attached to an already running browser.
pub struct CdpBrowser {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
}

impl CdpBrowser {
    pub async fn connect(control_url: &str) -> anyhow::Result<Self> {
        tracing::info!(control_url, "connect to browser");
        let (mut browser, mut handler) = Browser::connect(control_url)
            .await
            .with_context(|| format!("connect to browser at {control_url}"))?;

        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });

        browser
            .fetch_targets()
            .await
            .context("fetch browser targets")?;

        Ok(Self {
            browser: Mutex::new(browser),
            handler,
        })
    }

    async fn page(&self, target_id: &str) -> anyhow::Result<Page> {
        let mut browser = self.browser.lock().await;
        browser
            .fetch_targets()
            .await
            .context("fetch browser targets")?;
        let pages = browser.pages().await.context("list browser pages")?;
        pages
            .into_iter()
            .find(|page| page.target_id().inner() == target_id)
            .ok_or_else(|| anyhow::anyhow!("targetId == {target_id} not exists"))
    }
}

impl Drop for CdpBrowser {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[async_trait]
impl BrowserDriver for CdpBrowser {
    async fn pages(&self) -> anyhow::Result<Vec<PageInfo>> {
        let mut browser = self.browser.lock().await;
        let targets = browser
            .fetch_targets()
            .await
            .context("fetch browser targets")?;
        Ok(targets
            .into_iter()
            .filter(|target| target.r#type == "page")
            .map(|target| PageInfo {
                target_id: target.target_id.inner().clone(),
                page_type: target.r#type,
                title: target.title,
                url: target.url,
                attached: target.attached,
            })
            .collect())
    }

    async fn navigate(&self, target_id: &str, url: &str, wait: Duration) -> anyhow::Result<()> {
        let page = self.page(target_id).await?;
        wait_request_idle(&page, wait, async {
            page.goto(url)
                .await
                .with_context(|| format!("navigate {target_id} to {url}"))?;
            Ok(())
        })
        .await
    }

    async fn reload(&self, target_id: &str, wait: Duration) -> anyhow::Result<()> {
        let page = self.page(target_id).await?;
        wait_request_idle(&page, wait, async {
            page.reload()
                .await
                .with_context(|| format!("reload {target_id}"))?;
            Ok(())
        })
        .await
    }

    async fn inject_on_new_document(&self, target_id: &str, script: &str) -> anyhow::Result<()> {
        let page = self.page(target_id).await?;
        page.evaluate_on_new_document(AddScriptToEvaluateOnNewDocumentParams::new(script))
            .await
            .with_context(|| format!("inject script into {target_id}"))?;
        Ok(())
    }

    async fn inner_html(&self, target_id: &str) -> anyhow::Result<String> {
        let page = self.page(target_id).await?;
        page.evaluate(INNER_HTML_EXPRESSION)
            .await
            .with_context(|| format!("evaluate innerHTML of {target_id}"))?
            .into_value::<String>()
            .with_context(|| format!("decode innerHTML of {target_id}"))
    }
}

/// Runs `action` on `page`, then returns once no network request has been in flight for `idle`.
///
/// Listeners are attached before `action` starts so its own requests are counted.
async fn wait_request_idle<F>(page: &Page, idle: Duration, action: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let mut started = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .context("listen for network requests")?;
    let mut finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .context("listen for finished requests")?;
    let mut failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .context("listen for failed requests")?;

    action.await?;

    let deadline = tokio::time::sleep(idle + REQUEST_IDLE_LIMIT);
    tokio::pin!(deadline);
    let mut in_flight = HashSet::new();
    loop {
        tokio::select! {
            Some(event) = started.next() => {
                in_flight.insert(event.request_id.inner().clone());
            }
            Some(event) = finished.next() => {
                in_flight.remove(event.request_id.inner());
            }
            Some(event) = failed.next() => {
                in_flight.remove(event.request_id.inner());
            }
            () = tokio::time::sleep(idle), if in_flight.is_empty() => return Ok(()),
            () = &mut deadline => {
                tracing::warn!(in_flight = in_flight.len(), "requests still in flight, not waiting longer");
                return Ok(());
            }
        }
    }
}

/// Meta document written next to every page body snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshotMeta {
    #[serde(rename = "Scheme")]
    pub scheme: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "RawQuery")]
    pub raw_query: String,
    #[serde(rename = "Fragment")]
    pub fragment: String,
    #[serde(rename = "PageURL")]
    pub page_url: String,
    #[serde(rename = "TargetID")]
    pub target_id: String,
    #[serde(rename = "BodyFilename")]
    pub body_filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    pub meta: PathBuf,
    pub body: PathBuf,
}

/// Instruments matching pages and writes their DOM snapshots under `page/`.
pub struct PageRecorder {
    driver: Arc<dyn BrowserDriver>,
    page_match: Regex,
    page_dir: PathBuf,
    rest_addr: String,
}

impl PageRecorder {
    pub fn new(driver: Arc<dyn BrowserDriver>, ctx: &RuntimeContext) -> Self {
        Self::with_parts(
            driver,
            ctx.page_match().clone(),
            ctx.page_path(),
            ctx.options().rest_addr.clone(),
        )
    }

    pub fn with_parts(
        driver: Arc<dyn BrowserDriver>,
        page_match: Regex,
        page_dir: impl Into<PathBuf>,
        rest_addr: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            page_match,
            page_dir: page_dir.into(),
            rest_addr: rest_addr.into(),
        }
    }

    pub fn driver(&self) -> &dyn BrowserDriver {
        self.driver.as_ref()
    }

    pub fn bootstrap_script(&self) -> String {
        BOOTSTRAP_SCRIPT.replace(API_URL_PLACEHOLDER, &self.rest_addr)
    }

    pub async fn matching_pages(&self) -> anyhow::Result<Vec<PageInfo>> {
        let pages = self.driver.pages().await?;
        Ok(pages
            .into_iter()
            .filter(|page| self.page_match.is_match(&page.url))
            .collect())
    }

    /// Injects the bootstrap script into every matching page and reloads it.
    pub async fn instrument(&self) -> anyhow::Result<()> {
        let script = self.bootstrap_script();
        for page in self.matching_pages().await? {
            self.driver
                .inject_on_new_document(&page.target_id, &script)
                .await?;
            tracing::info!(url = %page.url, target_id = %page.target_id, "reload");
            self.driver
                .reload(&page.target_id, INSTRUMENT_RELOAD_WAIT)
                .await?;
        }
        Ok(())
    }

    pub async fn navigate(
        &self,
        target_id: &str,
        url: &str,
        wait: Duration,
    ) -> anyhow::Result<SnapshotPaths> {
        let pages = self.driver.pages().await?;
        if !pages.iter().any(|page| page.target_id == target_id) {
            anyhow::bail!("targetId == {target_id} not exists");
        }

        self.driver.navigate(target_id, url, wait).await?;
        tracing::info!(url, target_id, "reload");
        self.driver.reload(target_id, wait).await?;

        let page = self
            .driver
            .pages()
            .await?
            .into_iter()
            .find(|page| page.target_id == target_id)
            .ok_or_else(|| anyhow::anyhow!("targetId == {target_id} not exists"))?;
        self.snapshot(&page).await
    }

    /// Reloads and snapshots every open page whose URL matches `pagematch`.
    pub async fn reload_matching(&self) -> anyhow::Result<()> {
        for page in self.matching_pages().await? {
            tracing::info!(url = %page.url, "reload");
            self.driver.reload(&page.target_id, Duration::ZERO).await?;
            self.snapshot(&page).await?;
        }
        Ok(())
    }

    pub async fn snapshot(&self, page: &PageInfo) -> anyhow::Result<SnapshotPaths> {
        let html = self.driver.inner_html(&page.target_id).await?;
        let url = url::Url::parse(&page.url)
            .with_context(|| format!("parse page URL `{}`", page.url))?;

        let host = url.host_str().unwrap_or_default();
        let paths = SnapshotPaths {
            meta: page_meta_path(&self.page_dir, host, url.path(), &page.target_id),
            body: page_body_path(&self.page_dir, host, url.path(), &page.target_id),
        };

        let meta = PageSnapshotMeta {
            scheme: url.scheme().to_owned(),
            host: match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_owned(),
            },
            path: url.path().to_owned(),
            raw_query: url.query().unwrap_or_default().to_owned(),
            fragment: url.fragment().unwrap_or_default().to_owned(),
            page_url: page.url.clone(),
            target_id: page.target_id.clone(),
            body_filename: paths.body.display().to_string(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta).context("serialize page meta")?;

        tokio::fs::write(&paths.meta, meta_json)
            .await
            .with_context(|| format!("write {}", paths.meta.display()))?;
        tracing::info!(page_filename = %paths.meta.display(), "write");
        tokio::fs::write(&paths.body, html)
            .await
            .with_context(|| format!("write {}", paths.body.display()))?;
        tracing::info!(page_filename = %paths.body.display(), "write");

        Ok(paths)
    }

    /// Snapshots every matching page once per `period` until the task is aborted.
    pub fn spawn_poller(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let pages = match self.matching_pages().await {
                    Ok(pages) => pages,
                    Err(err) => {
                        tracing::warn!("list pages: {err:#}");
                        continue;
                    }
                };
                for page in pages {
                    if let Err(err) = self.snapshot(&page).await {
                        tracing::error!(target_id = %page.target_id, "store page: {err:#}");
                    }
                }
            }
        })
    }
}

pub fn page_body_path(dir: &Path, host: &str, path: &str, target_id: &str) -> PathBuf {
    dir.join(format!(
        "page_{host}_{}_{target_id}_body.html",
        path.replace('/', "__")
    ))
}

pub fn page_meta_path(dir: &Path, host: &str, path: &str, target_id: &str) -> PathBuf {
    dir.join(format!(
        "page_{host}_{}_{target_id}_meta.json",
        path.replace('/', "_")
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        path::Path,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use regex::Regex;
    use tempfile::tempdir;

    use super::{BrowserDriver, PageInfo, PageRecorder, PageSnapshotMeta, page_body_path, page_meta_path};

    #[derive(Default)]
    pub(crate) struct FakeDriver {
        pub pages: Mutex<Vec<PageInfo>>,
        pub injected: Mutex<Vec<(String, String)>>,
        pub reloads: Mutex<Vec<String>>,
    }

    impl FakeDriver {
        pub fn with_pages(pages: &[(&str, &str)]) -> Self {
            let driver = Self::default();
            *driver.pages.lock().unwrap() = pages
                .iter()
                .map(|(target_id, url)| PageInfo {
                    target_id: (*target_id).to_owned(),
                    page_type: "page".to_owned(),
                    title: String::new(),
                    url: (*url).to_owned(),
                    attached: true,
                })
                .collect();
            driver
        }
    }

    #[async_trait]
    impl BrowserDriver for FakeDriver {
        async fn pages(&self) -> anyhow::Result<Vec<PageInfo>> {
            Ok(self.pages.lock().unwrap().clone())
        }

        async fn navigate(&self, target_id: &str, url: &str, _wait: Duration) -> anyhow::Result<()> {
            let mut pages = self.pages.lock().unwrap();
            let page = pages
                .iter_mut()
                .find(|page| page.target_id == target_id)
                .ok_or_else(|| anyhow::anyhow!("unknown target {target_id}"))?;
            page.url = url.to_owned();
            Ok(())
        }

        async fn reload(&self, target_id: &str, _wait: Duration) -> anyhow::Result<()> {
            self.reloads.lock().unwrap().push(target_id.to_owned());
            Ok(())
        }

        async fn inject_on_new_document(&self, target_id: &str, script: &str) -> anyhow::Result<()> {
            self.injected
                .lock()
                .unwrap()
                .push((target_id.to_owned(), script.to_owned()));
            Ok(())
        }

        async fn inner_html(&self, target_id: &str) -> anyhow::Result<String> {
            Ok(format!("<body>{target_id}</body>"))
        }
    }

    fn recorder(driver: Arc<FakeDriver>, page_match: &str, dir: &Path) -> PageRecorder {
        PageRecorder::with_parts(
            driver,
            Regex::new(page_match).unwrap(),
            dir,
            "http://localhost:3333",
        )
    }

    #[test]
    fn snapshot_file_names_keep_separator_asymmetry() {
        let dir = Path::new("/out/page");
        assert_eq!(
            page_body_path(dir, "x", "/a/b", "T1"),
            dir.join("page_x___a__b_T1_body.html")
        );
        assert_eq!(
            page_meta_path(dir, "x", "/a/b", "T1"),
            dir.join("page_x__a_b_T1_meta.json")
        );
    }

    #[test]
    fn bootstrap_script_points_at_rest_addr() {
        let temp_dir = tempdir().unwrap();
        let recorder = recorder(Arc::new(FakeDriver::default()), "^.*$", temp_dir.path());
        let script = recorder.bootstrap_script();
        assert!(script.contains("\"http://localhost:3333\""));
        assert!(!script.contains("{{{ANOTHERPROXY_API_URL}}}"));
    }

    #[tokio::test]
    async fn instrument_injects_and_reloads_only_matching_pages() {
        let temp_dir = tempdir().unwrap();
        let driver = Arc::new(FakeDriver::with_pages(&[
            ("T1", "https://app.test/home"),
            ("T2", "https://other.test/"),
        ]));
        let recorder = recorder(driver.clone(), "app\\.test", temp_dir.path());

        recorder.instrument().await.unwrap();

        let injected = driver.injected.lock().unwrap().clone();
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].0, "T1");
        assert!(injected[0].1.contains("http://localhost:3333"));
        assert_eq!(*driver.reloads.lock().unwrap(), vec!["T1".to_owned()]);
    }

    #[tokio::test]
    async fn navigate_writes_snapshot_pair() {
        let temp_dir = tempdir().unwrap();
        let driver = Arc::new(FakeDriver::with_pages(&[("T1", "about:blank")]));
        let recorder = recorder(Arc::clone(&driver), "^.*$", temp_dir.path());

        let paths = recorder
            .navigate("T1", "http://x/?q=1#frag", Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(*driver.reloads.lock().unwrap(), vec!["T1".to_owned()]);

        assert_eq!(paths.body, temp_dir.path().join("page_x____T1_body.html"));
        assert_eq!(paths.meta, temp_dir.path().join("page_x___T1_meta.json"));
        assert_eq!(std::fs::read_to_string(&paths.body).unwrap(), "<body>T1</body>");

        let meta: PageSnapshotMeta =
            serde_json::from_slice(&std::fs::read(&paths.meta).unwrap()).unwrap();
        assert_eq!(meta.scheme, "http");
        assert_eq!(meta.host, "x");
        assert_eq!(meta.path, "/");
        assert_eq!(meta.raw_query, "q=1");
        assert_eq!(meta.fragment, "frag");
        assert_eq!(meta.page_url, "http://x/?q=1#frag");
        assert_eq!(meta.target_id, "T1");
        assert_eq!(meta.body_filename, paths.body.display().to_string());
    }

    #[tokio::test]
    async fn navigate_unknown_target_fails() {
        let temp_dir = tempdir().unwrap();
        let driver = Arc::new(FakeDriver::with_pages(&[("T1", "about:blank")]));
        let recorder = recorder(driver, "^.*$", temp_dir.path());

        let err = recorder
            .navigate("T9", "http://x/", Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "targetId == T9 not exists");
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn reload_matching_snapshots_each_match() {
        let temp_dir = tempdir().unwrap();
        let driver = Arc::new(FakeDriver::with_pages(&[
            ("T1", "https://app.test:8443/a"),
            ("T2", "https://other.test/"),
        ]));
        let recorder = recorder(driver.clone(), "app\\.test", temp_dir.path());

        recorder.reload_matching().await.unwrap();

        assert_eq!(*driver.reloads.lock().unwrap(), vec!["T1".to_owned()]);
        let meta: PageSnapshotMeta = serde_json::from_slice(
            &std::fs::read(temp_dir.path().join("page_app.test__a_T1_meta.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta.host, "app.test:8443");
        assert!(temp_dir.path().join("page_app.test___a_T1_body.html").exists());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn poller_snapshots_after_each_period() {
        let temp_dir = tempdir().unwrap();
        let driver = Arc::new(FakeDriver::with_pages(&[("T1", "https://app.test/")]));
        let recorder = Arc::new(recorder(driver, "^.*$", temp_dir.path()));
        let body = temp_dir.path().join("page_app.test____T1_body.html");

        let poller = recorder.spawn_poller(Duration::from_millis(20));
        for _ in 0..100 {
            if body.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        poller.abort();

        assert!(body.exists());
    }
}
