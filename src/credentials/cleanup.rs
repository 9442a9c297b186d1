//! Async cleanup that survives cancellation.
//!
//! A capture attempt can be dropped at any await point when the refresh
//! timeout fires. [`CleanupGuard`] owns the resources the attempt opened and
//! releases them either inline through [`CleanupGuard::run`] or, when the
//! guard is dropped first, on a spawned task.

#![cfg_attr(not(feature = "browser"), allow(dead_code))]

use futures::future::BoxFuture;
use tracing::debug;

pub(crate) type CleanupFn<T> = fn(T) -> BoxFuture<'static, ()>;

pub(crate) struct CleanupGuard<T: Default + Send + 'static> {
    resources: T,
    cleanup: CleanupFn<T>,
    done: bool,
}

impl<T: Default + Send + 'static> CleanupGuard<T> {
    pub(crate) fn new(resources: T, cleanup: CleanupFn<T>) -> Self {
        Self {
            resources,
            cleanup,
            done: false,
        }
    }

    pub(crate) fn resources_mut(&mut self) -> &mut T {
        &mut self.resources
    }

    /// Release the resources now.
    pub(crate) async fn run(mut self) {
        self.done = true;
        let resources = std::mem::take(&mut self.resources);
        (self.cleanup)(resources).await;
    }
}

impl<T: Default + Send + 'static> Drop for CleanupGuard<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let resources = std::mem::take(&mut self.resources);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn((self.cleanup)(resources));
            }
            Err(_) => debug!("No runtime left, skipping deferred cleanup"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Opened {
        counter: Option<Arc<AtomicUsize>>,
        pages: usize,
    }

    fn release(opened: Opened) -> BoxFuture<'static, ()> {
        async move {
            if let Some(counter) = opened.counter {
                counter.fetch_add(1 + opened.pages, Ordering::SeqCst);
            }
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_run_releases_inline_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut guard = CleanupGuard::new(
            Opened {
                counter: Some(Arc::clone(&counter)),
                pages: 0,
            },
            release,
        );
        guard.resources_mut().pages = 2;
        guard.run().await;

        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_attempt_still_releases() {
        let counter = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&counter);

        let attempt = async move {
            let mut guard = CleanupGuard::new(
                Opened {
                    counter: Some(shared),
                    pages: 0,
                },
                release,
            );
            guard.resources_mut().pages = 1;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            guard.run().await;
        };
        let timed_out = tokio::time::timeout(Duration::from_millis(10), attempt).await;
        assert!(timed_out.is_err());

        tokio::time::timeout(Duration::from_secs(1), async {
            while counter.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
