use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

/// The leader task went away (panicked or was cancelled) without publishing
/// a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("in-flight call was abandoned")]
pub struct Abandoned;

type Slot<T> = watch::Receiver<Option<T>>;

/// Coalesces concurrent calls for the same key into one execution.
///
/// The first caller for a key spawns the call on its own task, so a caller
/// that gives up waiting does not cancel the work for the others. Every
/// caller, leader included, waits on the same single-assignment slot.
pub struct Group<K, T> {
    calls: Arc<DashMap<K, Slot<T>>>,
}

impl<K, T> Default for Group<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Group<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
        }
    }

    pub async fn do_call<F, Fut>(&self, key: &K, f: F) -> Result<T, Abandoned>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let (rx, leader) = match self.calls.entry(key.clone()) {
            Entry::Occupied(existing) => (existing.get().clone(), None),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx.clone());
                (rx, Some(tx))
            }
        };

        if let Some(tx) = leader {
            let guard = CallGuard {
                calls: Arc::clone(&self.calls),
                key: key.clone(),
                rx: rx.clone(),
            };
            tokio::spawn(run_call(guard, tx, f));
        }

        wait(rx).await
    }

    /// Number of keys with a call currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.calls.contains_key(key)
    }
}

async fn wait<T: Clone>(mut rx: Slot<T>) -> Result<T, Abandoned> {
    let slot = rx.wait_for(Option::is_some).await.map_err(|_| Abandoned)?;
    slot.as_ref().cloned().ok_or(Abandoned)
}

async fn run_call<K, T, F, Fut>(guard: CallGuard<K, T>, tx: watch::Sender<Option<T>>, f: F)
where
    K: Eq + Hash,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let result = f().await;
    tx.send_replace(Some(result));
    drop(guard);
}

/// Unregisters the call once it finishes, including when the leader task
/// unwinds. Dropping the sender alongside wakes any waiter with `Abandoned`.
struct CallGuard<K: Eq + Hash, T> {
    calls: Arc<DashMap<K, Slot<T>>>,
    key: K,
    rx: Slot<T>,
}

impl<K: Eq + Hash, T> Drop for CallGuard<K, T> {
    fn drop(&mut self) {
        self.calls
            .remove_if(&self.key, |_, registered| registered.same_channel(&self.rx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_calls_share_one_execution() {
        let group: Arc<Group<String, u64>> = Arc::new(Group::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let group = Arc::clone(&group);
            let runs = Arc::clone(&runs);
            tasks.push(tokio::spawn(async move {
                group
                    .do_call(&"k".to_string(), move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(42));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let group: Group<String, String> = Group::new();
        let (ka, kb) = ("a".to_string(), "b".to_string());
        let (a, b) = tokio::join!(
            group.do_call(&ka, || async { "A".to_string() }),
            group.do_call(&kb, || async { "B".to_string() }),
        );
        assert_eq!(a.unwrap(), "A");
        assert_eq!(b.unwrap(), "B");
    }

    #[tokio::test]
    async fn sequential_calls_run_again() {
        let group: Group<String, usize> = Group::new();
        let runs = Arc::new(AtomicUsize::new(0));
        for expected in 1..=3 {
            let runs = Arc::clone(&runs);
            let got = group
                .do_call(&"k".to_string(), move || async move {
                    runs.fetch_add(1, Ordering::SeqCst) + 1
                })
                .await
                .unwrap();
            assert_eq!(got, expected);
            // the slot is removed right after publishing
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn panicking_leader_releases_waiters() {
        let group: Group<String, u8> = Group::new();
        let result = group
            .do_call(&"boom".to_string(), || async {
                let fail = true;
                if fail {
                    panic!("leader failed");
                }
                7
            })
            .await;
        assert_eq!(result, Err(Abandoned));
        tokio::task::yield_now().await;
        assert!(!group.is_in_flight(&"boom".to_string()));
    }
}
