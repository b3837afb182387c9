// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Where the list of monitored sites comes from.

use crate::model::Target;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait TargetSource: Send + Sync {
    /// Targets to check in a new run, in stable order.
    async fn active_targets(&self) -> Result<Vec<Target>>;
    /// Look up one target regardless of its active flag.
    async fn target(&self, id: &str) -> Result<Option<Target>>;
}

/// Targets read from a JSON array on disk. Re-read on every call so edits
/// apply to the next run without a restart.
pub struct JsonTargetFile {
    path: PathBuf,
}

impl JsonTargetFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<Target>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read targets from {}", self.path.display()))?;
        let targets: Vec<Target> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid targets file {}", self.path.display()))?;
        validate_targets(&targets)?;
        Ok(targets)
    }
}

#[async_trait]
impl TargetSource for JsonTargetFile {
    async fn active_targets(&self) -> Result<Vec<Target>> {
        Ok(self.load().await?.into_iter().filter(|t| t.active).collect())
    }

    async fn target(&self, id: &str) -> Result<Option<Target>> {
        Ok(self.load().await?.into_iter().find(|t| t.id == id))
    }
}

/// In-memory targets.
#[derive(Debug, Clone, Default)]
pub struct StaticTargets(pub Vec<Target>);

#[async_trait]
impl TargetSource for StaticTargets {
    async fn active_targets(&self) -> Result<Vec<Target>> {
        Ok(self.0.iter().filter(|t| t.active).cloned().collect())
    }

    async fn target(&self, id: &str) -> Result<Option<Target>> {
        Ok(self.0.iter().find(|t| t.id == id).cloned())
    }
}

fn validate_targets(targets: &[Target]) -> Result<()> {
    let mut ids = HashSet::new();
    for target in targets {
        if !ids.insert(target.id.as_str()) {
            anyhow::bail!("duplicate target id {:?}", target.id);
        }
        url::Url::parse(&target.url)
            .with_context(|| format!("target {:?} has an invalid URL", target.id))?;
        if target.expected_tag_id.trim().is_empty() {
            anyhow::bail!("target {:?} has no expected_tag_id", target.id);
        }
    }
    Ok(())
}
