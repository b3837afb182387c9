// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deterministic in-memory renderer.
//!
//! Replays a per-URL [`PageScript`] instead of driving a real browser, so the
//! pool, capturer, runner and orchestrator can be exercised without Chromium.
//! Hits are delivered on timers relative to navigation commit, through the
//! same two channels a real page would use.

use super::{Launcher, NavigationResult, ObservedRequest, RenderContext, Renderer};
use crate::capture::{CONTAINER_PROBE_SCRIPT, DRAIN_SCRIPT};
use crate::error::NavigationFailure;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// How a scripted navigation ends.
#[derive(Debug, Clone)]
pub enum NavigationScript {
    /// Commit after the given delay (times out if the delay exceeds the budget).
    Commit { after: Duration },
    /// Fail immediately.
    Fail(NavigationFailure),
    /// Never commit.
    Hang,
}

/// A request the page issues after commit.
#[derive(Debug, Clone)]
pub struct ScriptedHit {
    pub url: String,
    pub body: Option<String>,
    pub after: Duration,
}

/// Behaviour of one navigation attempt.
#[derive(Debug, Clone)]
pub struct PageScript {
    pub navigation: NavigationScript,
    pub hits: Vec<ScriptedHit>,
    pub containers: Vec<String>,
    /// Simulates anti-automation scripts hiding requests from the debug channel.
    pub debug_channel_suppressed: bool,
    pub screenshot_fails: bool,
}

impl PageScript {
    /// Commits after 200ms and emits nothing.
    pub fn loads() -> Self {
        Self {
            navigation: NavigationScript::Commit {
                after: Duration::from_millis(200),
            },
            hits: Vec::new(),
            containers: Vec::new(),
            debug_channel_suppressed: false,
            screenshot_fails: false,
        }
    }

    pub fn fails(failure: NavigationFailure) -> Self {
        Self {
            navigation: NavigationScript::Fail(failure),
            ..Self::loads()
        }
    }

    pub fn hangs() -> Self {
        Self {
            navigation: NavigationScript::Hang,
            ..Self::loads()
        }
    }

    pub fn commit_after(mut self, after: Duration) -> Self {
        self.navigation = NavigationScript::Commit { after };
        self
    }

    pub fn with_hit(mut self, url: impl Into<String>, after: Duration) -> Self {
        self.hits.push(ScriptedHit {
            url: url.into(),
            body: None,
            after,
        });
        self
    }

    pub fn with_batched_hit(
        mut self,
        url: impl Into<String>,
        body: impl Into<String>,
        after: Duration,
    ) -> Self {
        self.hits.push(ScriptedHit {
            url: url.into(),
            body: Some(body.into()),
            after,
        });
        self
    }

    pub fn with_container(mut self, id: impl Into<String>) -> Self {
        self.containers.push(id.into());
        self
    }

    pub fn suppress_debug_channel(mut self) -> Self {
        self.debug_channel_suppressed = true;
        self
    }

    pub fn failing_screenshot(mut self) -> Self {
        self.screenshot_fails = true;
        self
    }
}

/// Scripts keyed by URL. Each navigation consumes the next script for its
/// URL; the last one repeats. Unknown URLs load and stay silent.
#[derive(Default)]
pub struct ScriptBook {
    pages: Mutex<HashMap<String, VecDeque<PageScript>>>,
    navigations: Mutex<Vec<String>>,
}

impl ScriptBook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the attempts for a URL, in order.
    pub fn script(&self, url: &str, attempts: Vec<PageScript>) {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        pages.insert(url.to_string(), attempts.into_iter().collect());
    }

    /// Every URL navigated so far, in order.
    pub fn navigations(&self) -> Vec<String> {
        self.navigations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_for(&self, url: &str) -> PageScript {
        self.navigations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.to_string());
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        match pages.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(PageScript::loads),
            Some(queue) => queue.front().cloned().unwrap_or_else(PageScript::loads),
            None => PageScript::loads(),
        }
    }
}

/// Launches [`ScriptedRenderer`]s sharing one [`ScriptBook`].
pub struct ScriptedLauncher {
    book: Arc<ScriptBook>,
    fail_launch_at: Option<usize>,
    fail_shutdown_at: Option<usize>,
    shutdowns: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    pub fn new(book: Arc<ScriptBook>) -> Self {
        Self {
            book,
            fail_launch_at: None,
            fail_shutdown_at: None,
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the launch of browser `index` fail.
    pub fn failing_launch_at(mut self, index: usize) -> Self {
        self.fail_launch_at = Some(index);
        self
    }

    /// Make shutting down browser `index` fail.
    pub fn failing_shutdown_at(mut self, index: usize) -> Self {
        self.fail_shutdown_at = Some(index);
        self
    }

    /// Number of browsers shut down successfully so far.
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self, index: usize) -> Result<Arc<dyn Renderer>> {
        if self.fail_launch_at == Some(index) {
            bail!("scripted launch failure for browser {index}");
        }
        Ok(Arc::new(ScriptedRenderer {
            book: Arc::clone(&self.book),
            fail_shutdown: self.fail_shutdown_at == Some(index),
            shutdowns: Arc::clone(&self.shutdowns),
            active_count: Arc::new(AtomicUsize::new(0)),
        }))
    }
}

/// One scripted "browser process".
pub struct ScriptedRenderer {
    book: Arc<ScriptBook>,
    fail_shutdown: bool,
    shutdowns: Arc<AtomicUsize>,
    active_count: Arc<AtomicUsize>,
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn new_context(&self) -> Result<Box<dyn RenderContext>> {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedContext {
            book: Arc::clone(&self.book),
            page: Arc::new(PageState::default()),
            network: None,
            hook_installed: false,
            screenshot_fails: false,
            tasks: Vec::new(),
            active_count: Arc::clone(&self.active_count),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        if self.fail_shutdown {
            bail!("scripted shutdown failure");
        }
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn active_contexts(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct PageState {
    hook_buffer: Mutex<Vec<serde_json::Value>>,
    containers: Mutex<Vec<String>>,
}

/// One scripted page session.
pub struct ScriptedContext {
    book: Arc<ScriptBook>,
    page: Arc<PageState>,
    network: Option<mpsc::UnboundedSender<ObservedRequest>>,
    hook_installed: bool,
    screenshot_fails: bool,
    tasks: Vec<JoinHandle<()>>,
    active_count: Arc<AtomicUsize>,
}

impl ScriptedContext {
    fn schedule(&mut self, script: &PageScript) {
        *self.page.containers.lock().unwrap_or_else(|e| e.into_inner()) =
            script.containers.clone();

        for hit in &script.hits {
            let hit = hit.clone();
            let page = Arc::clone(&self.page);
            let network = if script.debug_channel_suppressed {
                None
            } else {
                self.network.clone()
            };
            let hooked = self.hook_installed;
            self.tasks.push(tokio::spawn(async move {
                tokio::time::sleep(hit.after).await;
                if let Some(tx) = network {
                    let _ = tx.send(ObservedRequest {
                        url: hit.url.clone(),
                        body: None,
                        observed_at: chrono::Utc::now(),
                    });
                }
                if hooked {
                    page.hook_buffer
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(serde_json::json!({
                            "url": hit.url,
                            "body": hit.body,
                            "ts": chrono::Utc::now().timestamp_millis(),
                        }));
                }
            }));
        }
    }
}

#[async_trait]
impl RenderContext for ScriptedContext {
    async fn install_init_script(&mut self, _script: &str) -> Result<()> {
        self.hook_installed = true;
        Ok(())
    }

    async fn observe_requests(&mut self) -> Result<mpsc::UnboundedReceiver<ObservedRequest>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.network = Some(tx);
        Ok(rx)
    }

    async fn navigate(
        &mut self,
        url: &str,
        timeout_ms: u64,
    ) -> std::result::Result<NavigationResult, NavigationFailure> {
        let script = self.book.next_for(url);
        let budget = Duration::from_millis(timeout_ms);
        self.screenshot_fails = script.screenshot_fails;
        match &script.navigation {
            NavigationScript::Hang => {
                tokio::time::sleep(budget).await;
                Err(NavigationFailure::Timeout { timeout_ms })
            }
            NavigationScript::Fail(failure) => Err(failure.clone()),
            NavigationScript::Commit { after } if *after > budget => {
                tokio::time::sleep(budget).await;
                Err(NavigationFailure::Timeout { timeout_ms })
            }
            NavigationScript::Commit { after } => {
                tokio::time::sleep(*after).await;
                self.schedule(&script);
                Ok(NavigationResult {
                    final_url: url.to_string(),
                    load_time_ms: after.as_millis() as u64,
                })
            }
        }
    }

    async fn execute_js(&self, script: &str) -> Result<serde_json::Value> {
        if script == DRAIN_SCRIPT {
            let drained = {
                let mut buffer = self.page.hook_buffer.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *buffer)
            };
            return Ok(serde_json::Value::Array(drained));
        }
        if script == CONTAINER_PROBE_SCRIPT {
            let containers = self
                .page
                .containers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            return Ok(serde_json::json!(containers));
        }
        Ok(serde_json::Value::Null)
    }

    async fn interact(&mut self) -> Result<()> {
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        if self.screenshot_fails {
            bail!("scripted screenshot failure");
        }
        Ok(PNG_MAGIC.to_vec())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_scripted_hits_reach_both_channels() {
        let book = ScriptBook::new();
        book.script(
            "https://acme.test/",
            vec![PageScript::loads().with_hit(
                "https://www.google-analytics.com/g/collect?tid=G-1&en=page_view",
                Duration::from_millis(300),
            )],
        );
        let launcher = ScriptedLauncher::new(Arc::clone(&book));
        let renderer = launcher.launch(0).await.unwrap();
        let mut ctx = renderer.new_context().await.unwrap();
        ctx.install_init_script("hook").await.unwrap();
        let mut rx = ctx.observe_requests().await.unwrap();

        ctx.navigate("https://acme.test/", 5_000).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(rx.try_recv().is_ok());
        let drained = ctx.execute_js(DRAIN_SCRIPT).await.unwrap();
        assert_eq!(drained.as_array().unwrap().len(), 1);
        let again = ctx.execute_js(DRAIN_SCRIPT).await.unwrap();
        assert!(again.as_array().unwrap().is_empty());

        assert_eq!(renderer.active_contexts(), 1);
        ctx.close().await.unwrap();
        assert_eq!(renderer.active_contexts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_consumed_in_order_last_repeats() {
        let book = ScriptBook::new();
        book.script(
            "https://slow.test/",
            vec![PageScript::hangs(), PageScript::loads()],
        );
        let renderer = ScriptedLauncher::new(Arc::clone(&book))
            .launch(0)
            .await
            .unwrap();
        let mut ctx = renderer.new_context().await.unwrap();

        assert!(matches!(
            ctx.navigate("https://slow.test/", 1_000).await,
            Err(NavigationFailure::Timeout { timeout_ms: 1_000 })
        ));
        assert!(ctx.navigate("https://slow.test/", 1_000).await.is_ok());
        assert!(ctx.navigate("https://slow.test/", 1_000).await.is_ok());
        assert_eq!(book.navigations().len(), 3);
    }
}
