// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size pool of long-lived browser instances.
//!
//! Each browser is handed to exactly one check at a time. Waiters block on a
//! [`Notify`] until a release or the deadline, whichever comes first.

use crate::error::PoolError;
use crate::renderer::{Launcher, Renderer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub struct BrowserPool {
    browsers: Vec<Arc<dyn Renderer>>,
    /// `true` when the slot is free.
    available: Mutex<Vec<bool>>,
    released: Notify,
    shut_down: AtomicBool,
}

impl BrowserPool {
    /// Launch `size` browsers sequentially.
    ///
    /// If any launch fails, the browsers already launched are shut down and
    /// the launch error is returned.
    pub async fn initialize(launcher: &dyn Launcher, size: usize) -> Result<Self, PoolError> {
        let mut browsers: Vec<Arc<dyn Renderer>> = Vec::with_capacity(size);
        for index in 0..size {
            match launcher.launch(index).await {
                Ok(browser) => {
                    tracing::debug!(index, "browser launched");
                    browsers.push(browser);
                }
                Err(source) => {
                    tracing::error!(index, "browser launch failed: {source:#}");
                    for (i, launched) in browsers.iter().enumerate() {
                        if let Err(e) = launched.shutdown().await {
                            tracing::warn!(index = i, "rollback shutdown failed: {e:#}");
                        }
                    }
                    return Err(PoolError::LaunchFailed { index, source });
                }
            }
        }
        tracing::info!(size, "browser pool ready");
        Ok(Self {
            available: Mutex::new(vec![true; browsers.len()]),
            browsers,
            released: Notify::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.browsers.len()
    }

    pub fn available_count(&self) -> usize {
        self.slots().iter().filter(|free| **free).count()
    }

    /// Wait up to `timeout` for a free browser and mark it in use.
    pub async fn acquire(
        &self,
        timeout: Duration,
    ) -> Result<(Arc<dyn Renderer>, usize), PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a release between the
            // check and the await is not lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shut_down.load(Ordering::SeqCst) {
                return Err(PoolError::ShutDown);
            }
            if let Some(index) = self.take_free_slot() {
                return Ok((Arc::clone(&self.browsers[index]), index));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(waited_ms = timeout.as_millis() as u64, "pool acquire timed out");
                return Err(PoolError::Timeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Return a browser to the pool and wake one waiter.
    pub fn release(&self, index: usize) -> Result<(), PoolError> {
        {
            let mut slots = self.slots();
            let slot = slots
                .get_mut(index)
                .ok_or(PoolError::IndexOutOfRange(index))?;
            if *slot {
                tracing::error!(index, "release of a browser that is not held");
                return Err(PoolError::NotHeld(index));
            }
            *slot = true;
        }
        self.released.notify_one();
        Ok(())
    }

    /// Close every browser. Individual failures are logged and counted; the
    /// rest still get closed.
    pub async fn shutdown(&self) -> usize {
        self.shut_down.store(true, Ordering::SeqCst);
        self.released.notify_waiters();
        let mut failures = 0;
        for (index, browser) in self.browsers.iter().enumerate() {
            if let Err(e) = browser.shutdown().await {
                failures += 1;
                tracing::warn!(index, "browser shutdown failed: {e:#}");
            }
        }
        tracing::info!(size = self.size(), failures, "browser pool shut down");
        failures
    }

    fn take_free_slot(&self) -> Option<usize> {
        let mut slots = self.slots();
        let index = slots.iter().position(|free| *free)?;
        slots[index] = false;
        Some(index)
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Vec<bool>> {
        self.available.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::scripted::{ScriptBook, ScriptedLauncher};

    async fn pool(size: usize) -> BrowserPool {
        let launcher = ScriptedLauncher::new(ScriptBook::new());
        BrowserPool::initialize(&launcher, size).await.unwrap()
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = pool(2).await;
        assert_eq!(pool.size(), 2);
        let (_, a) = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let (_, b) = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.available_count(), 0);
        pool.release(a).unwrap();
        assert_eq!(pool.available_count(), 1);
        pool.release(b).unwrap();
        assert_eq!(pool.available_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let pool = pool(1).await;
        let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let err = pool.acquire(Duration::from_secs(120)).await.err().unwrap();
        assert!(matches!(err, PoolError::Timeout { waited_ms: 120_000 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_wakes_on_release() {
        let pool = Arc::new(pool(1).await);
        let (_, index) = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(60)).await.map(|(_, i)| i) })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        pool.release(index).unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), index);
    }

    #[tokio::test]
    async fn test_release_misuse_is_an_error() {
        let pool = pool(1).await;
        assert!(matches!(pool.release(0), Err(PoolError::NotHeld(0))));
        assert!(matches!(pool.release(9), Err(PoolError::IndexOutOfRange(9))));
    }

    #[tokio::test]
    async fn test_launch_failure_rolls_back() {
        let launcher = ScriptedLauncher::new(ScriptBook::new()).failing_launch_at(2);
        let err = BrowserPool::initialize(&launcher, 4).await.err().unwrap();
        assert!(matches!(err, PoolError::LaunchFailed { index: 2, .. }));
        assert_eq!(launcher.shutdown_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_tolerates_failures() {
        let launcher = ScriptedLauncher::new(ScriptBook::new()).failing_shutdown_at(1);
        let pool = BrowserPool::initialize(&launcher, 3).await.unwrap();
        assert_eq!(pool.shutdown().await, 1);
        assert_eq!(launcher.shutdown_count(), 2);
        assert!(matches!(
            pool.acquire(Duration::from_secs(1)).await,
            Err(PoolError::ShutDown)
        ));
    }
}
