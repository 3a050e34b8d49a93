//! Per-key de-duplication of concurrent refreshes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

type SharedCall<T> = Shared<BoxFuture<'static, CoreResult<T>>>;
type CallTable<T> = Arc<Mutex<HashMap<String, (u64, SharedCall<T>)>>>;

/// At most one call per key runs at a time; late arrivals await the running
/// call and receive a clone of its outcome.
///
/// Calls run on their own task, so they complete and publish their result
/// even when every waiter has gone away.
pub struct SingleFlight<T> {
  calls: CallTable<T>,
  next_id: AtomicU64,
}

impl<T> Default for SingleFlight<T> {
  fn default() -> Self {
    Self {
      calls: Arc::new(Mutex::new(HashMap::new())),
      next_id: AtomicU64::new(0),
    }
  }
}

/// Clears the table slot when the call finishes, panics included.
struct SlotGuard<T> {
  calls: CallTable<T>,
  key: String,
  id: u64,
}

impl<T> Drop for SlotGuard<T> {
  fn drop(&mut self) {
    let mut calls = self.calls.lock();
    if calls.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
      calls.remove(&self.key);
    }
  }
}

impl<T> SingleFlight<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self::default()
  }

  /// Joins the in-flight call for `key`, or starts `work` if there is none.
  /// `work` is dropped unpolled when a call is already running.
  pub async fn run<F>(&self, key: &str, work: F) -> CoreResult<T>
  where
    F: Future<Output = CoreResult<T>> + Send + 'static,
  {
    let call = {
      let mut calls = self.calls.lock();
      if let Some((_, call)) = calls.get(key) {
        debug!("Joining in-flight refresh for {}", key);
        call.clone()
      } else {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = SlotGuard {
          calls: Arc::clone(&self.calls),
          key: key.to_string(),
          id,
        };
        let handle = tokio::spawn(async move {
          let _guard = guard;
          work.await
        });
        let call: SharedCall<T> = async move {
          handle
            .await
            .unwrap_or_else(|e| Err(CoreError::Task(e.to_string())))
        }
        .boxed()
        .shared();
        calls.insert(key.to_string(), (id, call.clone()));
        call
      }
    };

    call.await
  }

  /// Number of calls currently running.
  pub fn in_flight(&self) -> usize {
    self.calls.lock().len()
  }
}
