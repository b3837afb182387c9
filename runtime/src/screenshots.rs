// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Storage for end-of-check screenshots.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

use crate::model::Phase;

#[async_trait]
pub trait ScreenshotSink: Send + Sync {
    /// Persist a PNG and return a reference to it.
    async fn store(&self, run_id: &str, target_id: &str, phase: Phase, png: &[u8])
        -> Result<String>;
}

/// Writes `<root>/<run_id>/<target_id>-p<phase>.png`.
pub struct ScreenshotDir {
    root: PathBuf,
}

impl ScreenshotDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ScreenshotSink for ScreenshotDir {
    async fn store(
        &self,
        run_id: &str,
        target_id: &str,
        phase: Phase,
        png: &[u8],
    ) -> Result<String> {
        let dir = self.root.join(sanitize(run_id));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}-p{}.png", sanitize(target_id), phase.as_u8()));
        tokio::fs::write(&path, png)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path.display().to_string())
    }
}

/// Discards screenshots.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScreenshots;

#[async_trait]
impl ScreenshotSink for NoScreenshots {
    async fn store(&self, _: &str, _: &str, _: Phase, _: &[u8]) -> Result<String> {
        anyhow::bail!("screenshots disabled")
    }
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_under_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ScreenshotDir::new(dir.path());
        let path = sink
            .store("run-1", "acme/shop", Phase::Two, b"\x89PNG")
            .await
            .unwrap();
        assert!(path.ends_with("run-1/acme_shop-p2.png"));
        assert_eq!(std::fs::read(&path).unwrap(), b"\x89PNG");
    }
}
