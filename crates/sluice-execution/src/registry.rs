use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::plan::DataLocation;

/// The driver's rendezvous service mapping shard names to data locations.
/// The scheduler publishes locations when a producing task group is placed;
/// downstream task startup blocks here until its inputs are registered.
#[derive(Default)]
pub struct ShardRegistry {
    inner: Mutex<HashMap<String, DataLocation>>,
    notify: Notify,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the location of a shard and wake all waiters.
    /// Re-publication is allowed so that a restarted task group can place
    /// the same shard names at a new location; the last write wins.
    pub fn set(&self, location: DataLocation) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.insert(location.name.clone(), location);
        }
        self.notify.notify_waiters();
    }

    pub fn get(&self, name: &str) -> Option<DataLocation> {
        let inner = self.inner.lock().unwrap();
        inner.get(name).cloned()
    }

    /// Wait until the shard has a registered location.
    pub async fn wait(&self, name: &str) -> DataLocation {
        loop {
            // The waiter must be armed before the lookup, otherwise a `set`
            // between the lookup and the await would be missed.
            let notified = self.notify.notified();
            if let Some(location) = self.get(name) {
                if location.is_registered() {
                    return location;
                }
            }
            notified.await;
        }
    }

    /// Wait until every named shard has a registered location.
    pub async fn wait_all<I>(&self, names: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for name in names {
            self.wait(name.as_ref()).await;
        }
    }
}
