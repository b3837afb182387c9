// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dual-channel analytics event capture.
//!
//! Two independent observers watch the same outbound requests:
//!
//! 1. **Debug protocol**: `Network.requestWillBeSent` on the page session.
//!    Anti-automation scripts can silently suppress this channel.
//! 2. **Page hook**: an init script wrapping `fetch`, `XMLHttpRequest` and
//!    `navigator.sendBeacon` that buffers matching calls in the page.
//!
//! [`EventCapturer::drain`] pulls both channels into a [`HitLog`] that
//! deduplicates by exact request URL, then parses each hit into
//! [`CapturedEvent`]s. Waiting is a bounded poll loop over the merged log.

use crate::model::{CaptureChannel, CapturedEvent, EventKind};
use crate::renderer::{ObservedRequest, RenderContext};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Installed before any page script. Buffers matching request primitives in
/// `window.__tagwatchHits`.
pub const HOOK_SCRIPT: &str = r#"(() => {
  if (window.__tagwatchHooked) return;
  window.__tagwatchHooked = true;
  window.__tagwatchHits = window.__tagwatchHits || [];
  const pattern = /^https?:\/\/([a-z0-9-]+\.)*(google-analytics\.com|analytics\.google\.com)\/(g\/collect|j\/collect|mp\/collect|collect)(\?|$)/i;
  const record = (url, body) => {
    try {
      const abs = new URL(String(url), location.href).href;
      if (!pattern.test(abs)) return;
      window.__tagwatchHits.push({
        url: abs,
        body: typeof body === 'string' ? body : null,
        ts: Date.now(),
      });
    } catch (_) {}
  };
  const origFetch = window.fetch;
  if (origFetch) {
    window.fetch = function (input, init) {
      record(input && input.url ? input.url : input, init && init.body);
      return origFetch.apply(this, arguments);
    };
  }
  const origOpen = XMLHttpRequest.prototype.open;
  const origSend = XMLHttpRequest.prototype.send;
  XMLHttpRequest.prototype.open = function (method, url) {
    this.__tagwatchUrl = url;
    return origOpen.apply(this, arguments);
  };
  XMLHttpRequest.prototype.send = function (body) {
    if (this.__tagwatchUrl) record(this.__tagwatchUrl, body);
    return origSend.apply(this, arguments);
  };
  if (navigator.sendBeacon) {
    const origBeacon = navigator.sendBeacon.bind(navigator);
    navigator.sendBeacon = function (url, data) {
      record(url, data);
      return origBeacon(url, data);
    };
  }
})();"#;

/// Takes and clears the page hook buffer.
pub const DRAIN_SCRIPT: &str =
    "(() => { const q = window.__tagwatchHits || []; window.__tagwatchHits = []; return q; })()";

/// Lists tag-manager containers registered in the page.
pub const CONTAINER_PROBE_SCRIPT: &str =
    "(() => Object.keys(window.google_tag_manager || {}).filter(k => /^GTM-/.test(k)))()";

fn hit_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^https?://([a-z0-9-]+\.)*(google-analytics\.com|analytics\.google\.com)/(g/collect|j/collect|mp/collect|collect)(\?|$)",
        )
        .expect("hit regex is valid")
    })
}

fn container_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^https?://([a-z0-9-]+\.)*googletagmanager\.com/gtm\.js\?")
            .expect("container regex is valid")
    })
}

/// Classify a request URL as an analytics request, if it is one.
pub fn classify_url(url: &str) -> Option<EventKind> {
    if hit_pattern().is_match(url) {
        Some(EventKind::Hit)
    } else if container_pattern().is_match(url) {
        Some(EventKind::ContainerLoad)
    } else {
        None
    }
}

/// One raw request as seen by one channel, before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHit {
    pub channel: CaptureChannel,
    pub url: String,
    pub body: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl From<ObservedRequest> for RawHit {
    fn from(req: ObservedRequest) -> Self {
        Self {
            channel: CaptureChannel::DebugProtocol,
            url: req.url,
            body: req.body,
            observed_at: req.observed_at,
        }
    }
}

/// Arrival-ordered hits, unique by URL, with their parsed events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HitLog {
    hits: Vec<RawHit>,
    index: HashMap<String, usize>,
    events: Vec<CapturedEvent>,
}

impl HitLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch from either channel. Returns the number of new hits.
    ///
    /// The first arrival of a URL wins; a later duplicate only contributes a
    /// request body the first arrival lacked. Merging the same batch twice
    /// leaves the log unchanged.
    pub fn merge(&mut self, batch: impl IntoIterator<Item = RawHit>) -> usize {
        let mut added = 0;
        let mut changed = false;
        for hit in batch {
            match self.index.get(&hit.url) {
                Some(&pos) => {
                    let existing = &mut self.hits[pos];
                    if existing.body.is_none() && hit.body.is_some() {
                        existing.body = hit.body;
                        changed = true;
                    }
                }
                None => {
                    self.index.insert(hit.url.clone(), self.hits.len());
                    self.hits.push(hit);
                    added += 1;
                    changed = true;
                }
            }
        }
        if changed {
            self.events = self.hits.iter().flat_map(parse_hit).collect();
        }
        added
    }

    pub fn events(&self) -> &[CapturedEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Parse one hit into events.
///
/// Batched measurement requests carry one event per body line on top of the
/// shared URL parameters; everything else yields a single event.
pub fn parse_hit(hit: &RawHit) -> Vec<CapturedEvent> {
    let Some(kind) = classify_url(&hit.url) else {
        return Vec::new();
    };
    let base = query_params(&hit.url);

    let lines: Vec<&str> = hit
        .body
        .as_deref()
        .map(|b| b.lines().map(str::trim).filter(|l| l.contains('=')).collect())
        .unwrap_or_default();

    if kind == EventKind::Hit && !lines.is_empty() {
        lines
            .into_iter()
            .map(|line| {
                let mut params = base.clone();
                for (k, v) in url::form_urlencoded::parse(line.as_bytes()) {
                    params.insert(k.into_owned(), v.into_owned());
                }
                build_event(hit, kind, params)
            })
            .collect()
    } else {
        vec![build_event(hit, kind, base)]
    }
}

fn query_params(raw: &str) -> BTreeMap<String, String> {
    match url::Url::parse(raw) {
        Ok(u) => u
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        Err(_) => BTreeMap::new(),
    }
}

fn build_event(hit: &RawHit, kind: EventKind, params: BTreeMap<String, String>) -> CapturedEvent {
    let (tag_id, event_name) = match kind {
        EventKind::Hit => (params.get("tid").cloned(), params.get("en").cloned()),
        EventKind::ContainerLoad => (params.get("id").cloned(), None),
    };
    let custom = custom_params(&params);
    CapturedEvent {
        channel: hit.channel,
        kind,
        url: hit.url.clone(),
        tag_id,
        event_name,
        params,
        custom,
        observed_at: hit.observed_at,
    }
}

/// Implementation-specific parameters.
///
/// `ep.*`/`up.*` are string fields, `epn.*`/`upn.*` numeric ones. Server-side
/// setups may also ship a JSON object in `cd`; a payload that does not parse
/// as an object is treated as absent.
fn custom_params(params: &BTreeMap<String, String>) -> BTreeMap<String, serde_json::Value> {
    let mut custom = BTreeMap::new();
    for (key, value) in params {
        if let Some(name) = key.strip_prefix("epn.").or_else(|| key.strip_prefix("upn.")) {
            let number = value
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number);
            if let Some(n) = number {
                custom.insert(name.to_string(), n);
            }
        } else if let Some(name) = key.strip_prefix("ep.").or_else(|| key.strip_prefix("up.")) {
            custom.insert(name.to_string(), serde_json::Value::String(value.clone()));
        }
    }
    if let Some(raw) = params.get("cd") {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(raw) {
            custom.extend(map);
        }
    }
    custom
}

/// Parse the array returned by [`DRAIN_SCRIPT`]. Malformed entries are skipped.
pub fn parse_hook_batch(value: &serde_json::Value) -> Vec<RawHit> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let url = item.get("url")?.as_str()?.to_string();
            let body = item.get("body").and_then(|b| b.as_str()).map(String::from);
            let observed_at = item
                .get("ts")
                .and_then(|t| t.as_f64())
                .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
                .unwrap_or_else(Utc::now);
            Some(RawHit {
                channel: CaptureChannel::PageHook,
                url,
                body,
                observed_at,
            })
        })
        .collect()
}

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    pub elapsed: Duration,
    pub timed_out: bool,
}

/// Per-check capturer bound to one page session.
pub struct EventCapturer {
    network: mpsc::UnboundedReceiver<ObservedRequest>,
    log: HitLog,
    poll_interval: Duration,
}

impl EventCapturer {
    /// Install both channels. Must run before the first navigation.
    pub async fn attach(ctx: &mut dyn RenderContext, poll_interval: Duration) -> Result<Self> {
        ctx.install_init_script(HOOK_SCRIPT)
            .await
            .context("failed to install page hook")?;
        let network = ctx
            .observe_requests()
            .await
            .context("failed to attach network observer")?;
        Ok(Self {
            network,
            log: HitLog::new(),
            poll_interval,
        })
    }

    /// Pull newly observed requests from both channels into the log.
    /// Returns the number of new unique hits.
    pub async fn drain(&mut self, ctx: &dyn RenderContext) -> usize {
        let mut batch = Vec::new();
        while let Ok(req) = self.network.try_recv() {
            if classify_url(&req.url).is_some() {
                batch.push(RawHit::from(req));
            }
        }
        match ctx.execute_js(DRAIN_SCRIPT).await {
            Ok(value) => batch.extend(
                parse_hook_batch(&value)
                    .into_iter()
                    .filter(|h| classify_url(&h.url).is_some()),
            ),
            // Expected while a document is being replaced
            Err(e) => tracing::debug!("page hook drain failed: {e:#}"),
        }
        self.log.merge(batch)
    }

    pub fn events(&self) -> &[CapturedEvent] {
        self.log.events()
    }

    /// Poll the merged log until `predicate` holds or `timeout` elapses.
    pub async fn wait_for<F>(
        &mut self,
        ctx: &dyn RenderContext,
        predicate: F,
        timeout: Duration,
    ) -> WaitOutcome
    where
        F: Fn(&[CapturedEvent]) -> bool,
    {
        let start = Instant::now();
        loop {
            self.drain(ctx).await;
            let elapsed = start.elapsed();
            if predicate(self.log.events()) {
                return WaitOutcome {
                    elapsed,
                    timed_out: false,
                };
            }
            if elapsed >= timeout {
                return WaitOutcome {
                    elapsed,
                    timed_out: true,
                };
            }
            tokio::time::sleep(self.poll_interval.min(timeout - elapsed)).await;
        }
    }
}
