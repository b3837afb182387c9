// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Renderer abstraction for browser-driven checks.
//!
//! Defines the `Renderer` (one browser process), `RenderContext` (one page
//! session) and `Launcher` traits that abstract over the browser engine
//! (currently Chromium via chromiumoxide). The pool, capturer and runner only
//! see these traits.

pub mod chromium;
pub mod scripted;

use crate::error::NavigationFailure;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Result of navigating to a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationResult {
    /// The final URL after any redirects.
    pub final_url: String,
    /// Time taken until the page committed, in milliseconds.
    pub load_time_ms: u64,
}

/// An outbound request seen by the network-level observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedRequest {
    pub url: String,
    pub body: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// A browser process that can open page sessions.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Open a new page session (tab).
    async fn new_context(&self) -> Result<Box<dyn RenderContext>>;
    /// Shut down the browser process.
    async fn shutdown(&self) -> Result<()>;
    /// Number of currently open sessions.
    fn active_contexts(&self) -> usize;
}

/// A single page session driven through one check.
#[async_trait]
pub trait RenderContext: Send + Sync {
    /// Register a script that runs before any page script on every document.
    async fn install_init_script(&mut self, script: &str) -> Result<()>;
    /// Start observing outbound requests on the debug protocol channel.
    ///
    /// Every request the page issues is forwarded; filtering is the caller's job.
    async fn observe_requests(&mut self) -> Result<mpsc::UnboundedReceiver<ObservedRequest>>;
    /// Navigate and wait for the page to commit, bounded by `timeout_ms`.
    async fn navigate(
        &mut self,
        url: &str,
        timeout_ms: u64,
    ) -> std::result::Result<NavigationResult, NavigationFailure>;
    /// Execute JavaScript in the page context and return the result.
    async fn execute_js(&self, script: &str) -> Result<serde_json::Value>;
    /// Scroll and move the pointer to wake lazy-loaded instrumentation.
    async fn interact(&mut self) -> Result<()>;
    /// Capture a PNG of the current viewport.
    async fn screenshot(&self) -> Result<Vec<u8>>;
    /// Close this session.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Creates browser processes for the pool.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, index: usize) -> Result<Arc<dyn Renderer>>;
}
