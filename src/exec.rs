//! Run an action under a distributed lock.
//!
//! [`execute_locked`] is the fire-and-forget form: acquire, run,
//! release, and surface whichever error happened. It cannot stop the
//! action mid-flight, so the action may briefly outlive the lock if
//! ownership is lost while it runs.
//!
//! [`execute_abortable_locked`] closes that gap: the action runs in its
//! own task and is aborted the moment the lock is lost or the caller
//! cancels, at the cost of requiring a `'static` future.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::LockError;
use crate::lock::{Lock, LockOptions};
use crate::store::Store;

/// Acquire the lock at `key`, run `action`, then release.
///
/// The release happens whether or not the action succeeded; an action
/// error is reported as [`LockError::Action`] after the release. The
/// action itself is not cancelled if the lock is lost while it runs.
pub async fn execute_locked<F, Fut, T>(
    store: Arc<dyn Store>,
    key: impl Into<String>,
    action: F,
) -> Result<T, LockError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let lock = Lock::new(store, LockOptions::new(key));
    let _held = lock.acquire(None).await?;

    let result = action().await;

    if let Err(e) = lock.release().await {
        // The action's outcome matters more than the release error.
        warn!(error = %e, "failed to release lock after guarded action");
    }
    result.map_err(LockError::Action)
}

/// Acquire the lock described by `opts`, run `action` in a spawned
/// task, and abort it if the lock is lost or `cancel` fires.
///
/// Returns [`LockError::Aborted`] when ownership was lost mid-action
/// and [`LockError::Cancelled`] when the caller's signal won the race,
/// during acquisition or while the action runs. In both cases the
/// action task is aborted before the lock is released, so no work
/// continues past the loss of mutual exclusion.
pub async fn execute_abortable_locked<F, Fut, T>(
    store: Arc<dyn Store>,
    opts: LockOptions,
    cancel: Option<mpsc::Receiver<()>>,
    action: F,
) -> Result<T, LockError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    // The caller's signal has to cover both phases, so fan it out into
    // one channel for the acquisition and one for the action loop.
    let (acq_tx, acq_rx) = mpsc::channel(1);
    let (act_tx, mut act_rx) = mpsc::channel::<()>(1);
    let _guards = match cancel {
        Some(mut rx) => {
            tokio::spawn(async move {
                // Fires on send or when the caller drops the sender.
                let _ = rx.recv().await;
                drop(acq_tx);
                drop(act_tx);
            });
            None
        }
        None => Some((acq_tx, act_tx)),
    };

    let lock = Lock::new(store, opts);
    let mut held = lock.acquire(Some(acq_rx)).await?;

    let mut task = tokio::spawn(action());

    let outcome = loop {
        tokio::select! {
            joined = &mut task => {
                break match joined {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(LockError::Action(e)),
                    Err(join_err) => Err(LockError::Action(anyhow::anyhow!(join_err))),
                };
            }
            changed = held.changed() => {
                let lost = match changed {
                    Ok(()) => !*held.borrow(),
                    // Sender gone means the monitor exited; treat as loss.
                    Err(_) => true,
                };
                if lost {
                    task.abort();
                    debug!("lock lost, aborting guarded action");
                    break Err(LockError::Aborted);
                }
            }
            _ = act_rx.recv() => {
                task.abort();
                debug!("caller cancelled, aborting guarded action");
                break Err(LockError::Cancelled);
            }
        }
    };

    if lock.is_held() {
        if let Err(e) = lock.release().await {
            warn!(error = %e, "failed to release lock after guarded action");
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use crate::memory::MemoryStore;
    use crate::session::SessionManager;
    use crate::store::KvApi;

    fn store() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_execute_locked_runs_and_releases() {
        let store = store();
        let value = execute_locked(Arc::clone(&store), "svc/job", || async {
            Ok::<_, anyhow::Error>(42)
        })
        .await
        .unwrap();
        assert_eq!(value, 42);

        // Lock key is released, so a fresh lock can take it right away.
        let lock = Lock::new(Arc::clone(&store), LockOptions::new("svc/job"));
        let _held = lock.acquire(None).await.unwrap();
        assert!(lock.is_held());
    }

    #[tokio::test]
    async fn test_execute_locked_releases_on_action_error() {
        let store = store();
        let err = execute_locked(Arc::clone(&store), "svc/job", || async {
            anyhow::bail!("task exploded");
            #[allow(unreachable_code)]
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, LockError::Action(_)));
        assert!(err.to_string().contains("task exploded"));

        let pair = store.get("svc/job").await.unwrap().unwrap();
        assert!(pair.session.is_none());
    }

    #[tokio::test]
    async fn test_execute_locked_serializes_actions() {
        let store = store();
        let running = Arc::new(AtomicBool::new(false));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let running = Arc::clone(&running);
            tasks.push(tokio::spawn(async move {
                execute_locked(store, "svc/job", || async move {
                    assert!(!running.swap(true, Ordering::SeqCst), "overlap detected");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.store(false, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_abortable_action_completes_normally() {
        let store = store();
        let value = execute_abortable_locked(
            Arc::clone(&store),
            LockOptions::new("svc/job"),
            None,
            || async { Ok::<_, anyhow::Error>("done") },
        )
        .await
        .unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn test_abortable_action_aborted_on_lock_loss() {
        let store = store();
        let finished = Arc::new(AtomicBool::new(false));

        let task = {
            let store = Arc::clone(&store);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                execute_abortable_locked(store, LockOptions::new("svc/job"), None, move || {
                    async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(())
                    }
                })
                .await
            })
        };

        // Let it acquire, then kill its session out from under it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pair = store.get("svc/job").await.unwrap().unwrap();
        let sid = pair.session.unwrap();
        SessionManager::new(Arc::clone(&store))
            .destroy(&sid)
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(LockError::Aborted)));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_abortable_action_cancelled_by_caller() {
        let store = store();
        let (cancel_tx, cancel_rx) = mpsc::channel(1);

        let task = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                execute_abortable_locked(
                    store,
                    LockOptions::new("svc/job"),
                    Some(cancel_rx),
                    || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok::<_, anyhow::Error>(())
                    },
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_tx.send(()).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(LockError::Cancelled)));

        // The lock was released on the way out.
        let lock = Lock::new(Arc::clone(&store), LockOptions::new("svc/job"));
        let _held = lock.acquire(None).await.unwrap();
        assert!(lock.is_held());
    }
}
