// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Chromium-based renderer using chromiumoxide.

use super::{Launcher, NavigationResult, ObservedRequest, RenderContext, Renderer};
use crate::config::BrowserSettings;
use crate::error::NavigationFailure;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{self, EventRequestWillBeSent};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Find the Chromium binary path.
pub fn find_chromium(explicit: Option<&PathBuf>) -> Option<PathBuf> {
    // 1. Configured path (TAGWATCH_CHROMIUM_PATH / --chromium)
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.clone());
        }
    }

    // 2. ~/.tagwatch/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".tagwatch/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".tagwatch/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".tagwatch/chromium/chrome"),
            ]
        } else {
            vec![
                home.join(".tagwatch/chromium/chrome-linux64/chrome"),
                home.join(".tagwatch/chromium/chrome"),
            ]
        };
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 3. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 4. Common macOS location
    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Launches headless Chromium processes with the fixed low-fingerprint setup.
pub struct ChromiumLauncher {
    settings: BrowserSettings,
}

impl ChromiumLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Launcher for ChromiumLauncher {
    async fn launch(&self, index: usize) -> Result<Arc<dyn Renderer>> {
        let renderer = ChromiumRenderer::new(&self.settings, index).await?;
        Ok(Arc::new(renderer))
    }
}

/// One headless Chromium process.
pub struct ChromiumRenderer {
    browser: Mutex<Option<Browser>>,
    handler_task: JoinHandle<()>,
    active_count: Arc<AtomicUsize>,
}

impl ChromiumRenderer {
    /// Launch a headless Chromium instance.
    pub async fn new(settings: &BrowserSettings, index: usize) -> Result<Self> {
        let chrome_path = find_chromium(settings.chromium_path.as_ref())
            .context("Chromium not found. Set TAGWATCH_CHROMIUM_PATH.")?;

        let (width, height) = settings.window;
        let profile_dir = std::env::temp_dir().join(format!(
            "tagwatch-profile-{}-{index}",
            std::process::id()
        ));
        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .user_data_dir(profile_dir)
            .window_size(width, height)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg(format!("--user-agent={}", settings.user_agent))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!(index, "browser handler error: {e}");
                }
            }
        });

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            handler_task,
            active_count: Arc::new(AtomicUsize::new(0)),
        })
    }
}

/// Hides `navigator.webdriver` before any page script runs.
const STEALTH_SCRIPT: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined });";

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn new_context(&self) -> Result<Box<dyn RenderContext>> {
        let guard = self.browser.lock().await;
        let browser = guard.as_ref().context("browser already shut down")?;
        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;
        drop(guard);

        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(STEALTH_SCRIPT))
            .await
            .context("failed to install stealth script")?;

        self.active_count.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(ChromiumContext {
            page,
            listeners: Vec::new(),
            active_count: Arc::clone(&self.active_count),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        let browser = self.browser.lock().await.take();
        if let Some(mut browser) = browser {
            let closed = browser.close().await;
            let _ = browser.wait().await;
            self.handler_task.abort();
            closed.context("failed to close Chromium")?;
        }
        Ok(())
    }

    fn active_contexts(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

/// A single Chromium page session.
pub struct ChromiumContext {
    page: Page,
    listeners: Vec<JoinHandle<()>>,
    active_count: Arc<AtomicUsize>,
}

#[async_trait]
impl RenderContext for ChromiumContext {
    async fn install_init_script(&mut self, script: &str) -> Result<()> {
        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(script))
            .await
            .context("failed to install init script")?;
        Ok(())
    }

    async fn observe_requests(&mut self) -> Result<mpsc::UnboundedReceiver<ObservedRequest>> {
        let mut events = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .context("failed to subscribe to request events")?;
        self.page
            .execute(network::EnableParams::default())
            .await
            .context("failed to enable Network domain")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let observed = ObservedRequest {
                    url: event.request.url.clone(),
                    body: None,
                    observed_at: chrono::Utc::now(),
                };
                if tx.send(observed).is_err() {
                    break;
                }
            }
        });
        self.listeners.push(task);
        Ok(rx)
    }

    async fn navigate(
        &mut self,
        url: &str,
        timeout_ms: u64,
    ) -> std::result::Result<NavigationResult, NavigationFailure> {
        let start = Instant::now();

        let result =
            tokio::time::timeout(Duration::from_millis(timeout_ms), self.page.goto(url)).await;

        let load_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(_)) => {
                let final_url = self
                    .page
                    .url()
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| url.to_string());
                Ok(NavigationResult {
                    final_url,
                    load_time_ms,
                })
            }
            Ok(Err(e)) => match NavigationFailure::classify(&e.to_string()) {
                NavigationFailure::Timeout { .. } => Err(NavigationFailure::Timeout { timeout_ms }),
                other => Err(other),
            },
            Err(_) => Err(NavigationFailure::Timeout { timeout_ms }),
        }
    }

    async fn execute_js(&self, script: &str) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("JS execution failed")?;

        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert JS result: {e:?}"))
    }

    async fn interact(&mut self) -> Result<()> {
        self.page
            .evaluate("window.scrollBy(0, Math.round(window.innerHeight * 0.6))")
            .await
            .context("scroll failed")?;
        self.page
            .move_mouse(Point { x: 240.0, y: 320.0 })
            .await
            .context("pointer move failed")?;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.page
            .screenshot(ScreenshotParams::builder().build())
            .await
            .context("failed to take screenshot")
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.active_count.fetch_sub(1, Ordering::Relaxed);
        for task in &this.listeners {
            task.abort();
        }
        this.page.close().await.context("failed to close page")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_navigate_and_observe() {
        let renderer = ChromiumRenderer::new(&BrowserSettings::default(), 0)
            .await
            .expect("failed to create renderer");
        let mut ctx = renderer
            .new_context()
            .await
            .expect("failed to create context");
        let _rx = ctx.observe_requests().await.expect("observe failed");

        let nav = ctx
            .navigate("data:text/html,<h1>Hello</h1>", 10000)
            .await
            .expect("navigation failed");
        assert!(nav.load_time_ms < 10000);

        let result = ctx
            .execute_js("document.querySelector('h1').textContent")
            .await
            .expect("JS execution failed");
        assert_eq!(result.as_str().unwrap(), "Hello");

        let png = ctx.screenshot().await.expect("screenshot failed");
        assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));

        ctx.close().await.expect("close failed");
        assert_eq!(renderer.active_contexts(), 0);
        renderer.shutdown().await.expect("shutdown failed");
    }

    #[test]
    fn test_find_chromium_ignores_missing_explicit_path() {
        let missing = PathBuf::from("/definitely/not/here/chrome");
        let found = find_chromium(Some(&missing));
        assert_ne!(found, Some(missing));
    }
}
