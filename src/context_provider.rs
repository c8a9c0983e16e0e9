//! Versioned, thread-safe holder of the shared context

use crate::context::DatadogContext;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::trace;

/// Receives every committed context snapshot, in version order.
pub trait ContextPublisher: Send + Sync {
    fn publish(&self, context: Arc<DatadogContext>);
}

/// Holds the latest committed context.
///
/// Reads share the lock and only clone an `Arc`; a write takes the lock
/// exclusively, applies the mutation to a private copy and swaps the copy in,
/// so no reader can observe a half-applied mutation.
pub struct ContextProvider {
    current: RwLock<Arc<DatadogContext>>,
    publisher: OnceLock<Arc<dyn ContextPublisher>>,
}

impl ContextProvider {
    pub fn new(context: DatadogContext) -> Self {
        Self {
            current: RwLock::new(Arc::new(context)),
            publisher: OnceLock::new(),
        }
    }

    /// Installs the publisher notified after each write. Only the first call has an effect.
    pub fn set_publisher(&self, publisher: Arc<dyn ContextPublisher>) -> bool {
        self.publisher.set(publisher).is_ok()
    }

    /// Latest committed snapshot.
    pub fn read(&self) -> Arc<DatadogContext> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current)
    }

    /// Applies `mutation` exclusively and publishes the resulting snapshot.
    pub fn write<F>(&self, mutation: F) -> Arc<DatadogContext>
    where
        F: FnOnce(&mut DatadogContext),
    {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);

        let mut next = DatadogContext::clone(&current);
        mutation(&mut next);
        next.snapshot_version = current.snapshot_version + 1;

        let snapshot = Arc::new(next);
        *current = Arc::clone(&snapshot);
        trace!("Context updated to version {}", snapshot.snapshot_version);

        // Published under the write lock so subscribers receive snapshots in version order.
        if let Some(publisher) = self.publisher.get() {
            publisher.publish(Arc::clone(&snapshot));
        }

        snapshot
    }
}

impl std::fmt::Debug for ContextProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextProvider")
            .field("snapshot_version", &self.read().snapshot_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::TrackingConsent;
    use std::sync::Mutex;
    use std::thread;

    #[derive(Default)]
    struct RecordingPublisher {
        versions: Mutex<Vec<u64>>,
    }

    impl ContextPublisher for RecordingPublisher {
        fn publish(&self, context: Arc<DatadogContext>) {
            self.versions.lock().unwrap().push(context.snapshot_version);
        }
    }

    fn provider() -> ContextProvider {
        ContextProvider::new(DatadogContext::new("svc", "test", "1.0", TrackingConsent::Pending))
    }

    #[test]
    fn test_write_bumps_version_and_is_visible() {
        let provider = provider();
        let before = provider.read();

        provider.write(|context| context.user.id = Some("user-1".to_string()));

        let after = provider.read();
        assert_eq!(before.snapshot_version, 0);
        assert_eq!(after.snapshot_version, before.snapshot_version + 1);
        assert_eq!(after.user.id.as_deref(), Some("user-1"));
        assert!(before.user.id.is_none());
    }

    #[test]
    fn test_mutation_cannot_move_version() {
        let provider = provider();
        provider.write(|context| context.snapshot_version = 100);
        assert_eq!(provider.read().snapshot_version, 1);
    }

    #[test]
    fn test_publisher_receives_full_snapshots_in_order() {
        let provider = provider();
        let publisher = Arc::new(RecordingPublisher::default());
        assert!(provider.set_publisher(publisher.clone()));

        for _ in 0..3 {
            provider.write(|context| context.is_low_power_mode_enabled ^= true);
        }

        assert_eq!(*publisher.versions.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_readers_never_regress() {
        let provider = Arc::new(provider());
        let publisher = Arc::new(RecordingPublisher::default());
        provider.set_publisher(publisher.clone());

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let provider = Arc::clone(&provider);
                thread::spawn(move || {
                    for n in 0..250 {
                        provider.write(|context| {
                            context.user.name = Some(format!("writer-{}-{}", i, n));
                        });
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let provider = Arc::clone(&provider);
                thread::spawn(move || {
                    let mut last_seen = 0;
                    for _ in 0..1000 {
                        let version = provider.read().snapshot_version;
                        assert!(version >= last_seen, "context version regressed");
                        last_seen = version;
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }

        assert_eq!(provider.read().snapshot_version, 1000);
        let versions = publisher.versions.lock().unwrap();
        assert_eq!(versions.len(), 1000);
        assert!(versions.windows(2).all(|pair| pair[1] == pair[0] + 1));
    }
}
