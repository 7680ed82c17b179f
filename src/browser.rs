use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use std::ffi::OsStr;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SiteConfig;
use crate::utils::error::BrowserError;

/// One browser tab, as seen by the selection strategies.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), BrowserError>;

    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    /// Evaluate a script. Scripts return `JSON.stringify(...)`; the string is decoded here.
    async fn evaluate(&self, script: &str) -> Result<Value, BrowserError>;

    async fn content(&self) -> Result<String, BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Close the tab. Called exactly once, by [`PageLease`].
    fn close(&self);
}

#[async_trait]
pub trait BrowserProvider: Send + Sync {
    async fn open_page(&self) -> Result<Box<dyn PageDriver>, BrowserError>;
}

/// Counts pages handed out and given back.
#[derive(Debug, Clone, Default)]
pub struct PageTracker {
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl PageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }

    pub fn lease(&self, page: Box<dyn PageDriver>) -> PageLease {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        PageLease {
            page: Some(page),
            tracker: self.clone(),
        }
    }
}

/// A leased page. Dropping the lease closes the page and returns it to the tracker.
pub struct PageLease {
    page: Option<Box<dyn PageDriver>>,
    tracker: PageTracker,
}

impl Deref for PageLease {
    type Target = dyn PageDriver;

    fn deref(&self) -> &Self::Target {
        match &self.page {
            Some(page) => page.as_ref(),
            None => unreachable!("page is only taken in drop"),
        }
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            page.close();
            self.tracker.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for PageLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageLease")
            .field("open", &self.page.is_some())
            .finish()
    }
}

/// Hands out tracked page leases from a browser provider.
#[derive(Clone)]
pub struct PagePool {
    provider: Arc<dyn BrowserProvider>,
    tracker: PageTracker,
}

impl PagePool {
    pub fn new(provider: Arc<dyn BrowserProvider>) -> Self {
        Self {
            provider,
            tracker: PageTracker::new(),
        }
    }

    /// Open a page and lease it. Safe to cancel: a page that finishes opening after the
    /// caller gave up is still leased and closed.
    pub async fn lease(&self) -> Result<PageLease, BrowserError> {
        let provider = Arc::clone(&self.provider);
        let mut opening = PendingPage {
            handle: Some(tokio::spawn(async move { provider.open_page().await })),
            tracker: self.tracker.clone(),
        };
        let page = opening.wait().await?;
        Ok(self.tracker.lease(page))
    }

    pub fn tracker(&self) -> &PageTracker {
        &self.tracker
    }
}

type OpenPage = Result<Box<dyn PageDriver>, BrowserError>;

/// A page still being opened in its own task.
struct PendingPage {
    handle: Option<JoinHandle<OpenPage>>,
    tracker: PageTracker,
}

impl PendingPage {
    async fn wait(&mut self) -> OpenPage {
        let Some(handle) = self.handle.as_mut() else {
            return Err(BrowserError::Page("page already taken".to_string()));
        };
        let opened = handle.await;
        self.handle = None;
        opened.map_err(|e| BrowserError::Page(format!("browser task failed: {}", e)))?
    }
}

impl Drop for PendingPage {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let tracker = self.tracker.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Ok(Ok(page)) = handle.await {
                    debug!("Closing page that finished opening after its caller gave up");
                    drop(tracker.lease(page));
                }
            });
        }
    }
}

/// Headless Chrome instances, used round-robin.
pub struct ChromeBrowser {
    browsers: Vec<Arc<Browser>>,
    current_index: AtomicUsize,
    user_agent: String,
}

impl ChromeBrowser {
    pub fn launch(config: &SiteConfig, instances: usize) -> Result<Self, BrowserError> {
        let mut browsers = Vec::new();

        // Limit to max 3 for resource management
        for _ in 0..instances.clamp(1, 3) {
            let mut launch_options = LaunchOptions::default_builder()
                .headless(true)
                .sandbox(false)
                .args(vec![
                    OsStr::new("--no-sandbox"),
                    OsStr::new("--disable-dev-shm-usage"),
                    OsStr::new("--disable-gpu"),
                    OsStr::new("--disable-extensions"),
                    OsStr::new("--disable-background-timer-throttling"),
                ])
                .build()
                .map_err(|e| BrowserError::Launch(format!("invalid launch options: {}", e)))?;

            if let Some(chrome_path) = &config.chrome_path {
                launch_options.path = Some(PathBuf::from(chrome_path));
            }

            let browser =
                Browser::new(launch_options).map_err(|e| BrowserError::Launch(e.to_string()))?;
            browsers.push(Arc::new(browser));
        }

        debug!("Launched {} headless browser instance(s)", browsers.len());

        Ok(Self {
            browsers,
            current_index: AtomicUsize::new(0),
            user_agent: config.user_agent.clone(),
        })
    }

    fn next_browser(&self) -> Arc<Browser> {
        let index = self.current_index.fetch_add(1, Ordering::Relaxed) % self.browsers.len();
        Arc::clone(&self.browsers[index])
    }
}

#[async_trait]
impl BrowserProvider for ChromeBrowser {
    async fn open_page(&self) -> Result<Box<dyn PageDriver>, BrowserError> {
        let browser = self.next_browser();
        let user_agent = self.user_agent.clone();

        let tab = tokio::task::spawn_blocking(move || {
            let tab = browser
                .new_tab()
                .map_err(|e| BrowserError::Page(format!("failed to create tab: {}", e)))?;
            tab.set_user_agent(&user_agent, None, None)
                .map_err(|e| BrowserError::Page(format!("failed to set user agent: {}", e)))?;
            Ok::<_, BrowserError>(tab)
        })
        .await
        .map_err(|e| BrowserError::Page(format!("browser task failed: {}", e)))??;

        Ok(Box::new(ChromePage {
            tab,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct ChromePage {
    tab: Arc<Tab>,
    closed: AtomicBool,
}

impl Drop for ChromePage {
    fn drop(&mut self) {
        self.close();
    }
}

impl ChromePage {
    /// headless_chrome blocks the calling thread; keep it off the async workers.
    async fn blocking<T, F>(&self, f: F) -> Result<T, BrowserError>
    where
        F: FnOnce(&Tab) -> Result<T, BrowserError> + Send + 'static,
        T: Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| BrowserError::Page(format!("browser task failed: {}", e)))?
    }
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url)
                .and_then(|tab| tab.wait_until_navigated())
                .map(|_| ())
                .map_err(|e| BrowserError::Navigation(format!("{}: {}", url, e)))
        })
        .await
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        let selector = selector.to_string();
        self.blocking(move |tab| {
            tab.wait_for_element_with_custom_timeout(&selector, timeout)
                .map(|_| ())
                .map_err(|_| BrowserError::ElementNotFound { selector })
        })
        .await
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let selector = selector.to_string();
        self.blocking(move |tab| {
            let element = tab
                .find_element(&selector)
                .map_err(|_| BrowserError::ElementNotFound {
                    selector: selector.clone(),
                })?;
            element
                .click()
                .map(|_| ())
                .map_err(|e| BrowserError::Script(format!("click on '{}' failed: {}", selector, e)))
        })
        .await
    }

    async fn evaluate(&self, script: &str) -> Result<Value, BrowserError> {
        let script = script.to_string();
        self.blocking(move |tab| {
            let remote = tab
                .evaluate(&script, false)
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            Ok(decode_script_value(remote.value))
        })
        .await
    }

    async fn content(&self) -> Result<String, BrowserError> {
        self.blocking(|tab| {
            tab.get_content()
                .map_err(|e| BrowserError::Page(format!("failed to read content: {}", e)))
        })
        .await
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.tab.get_url())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tab = Arc::clone(&self.tab);
        let close = move || {
            if let Err(e) = tab.close(true) {
                warn!("Failed to close browser tab: {}", e);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(close);
            }
            Err(_) => close(),
        }
    }
}

/// Scripts hand back `JSON.stringify(...)` output; decode it, keeping non-JSON strings as-is.
fn decode_script_value(value: Option<Value>) -> Value {
    match value {
        Some(Value::String(raw)) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        Some(other) => other,
        None => Value::Null,
    }
}
