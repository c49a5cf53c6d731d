//! The process-lifetime route context.
//!
//! A [`RouteCxt`] is created once at process start and never torn down. It
//! carries the pieces every effect may need besides the state itself: the
//! broadcast of container lifecycle events fed in by platform glue, and the
//! ordered fire-and-forget side-effect queue.

use crate::containers::{ContainerHandle, LifecycleEvent};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Error type side-effect units may report; logged, never propagated.
pub type SideEffectError = Box<dyn std::error::Error + Send + Sync>;

/// One unit of fire-and-forget asynchronous work.
pub type SideEffect = BoxFuture<'static, Result<(), SideEffectError>>;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Process-lifetime immutable handle shared by all effects.
pub struct RouteCxt {
    events: broadcast::Sender<LifecycleEvent>,
    side_effects: mpsc::UnboundedSender<SideEffect>,
}

impl RouteCxt {
    /// Creates the context and spawns its side-effect consumer loop.
    /// Must be called from within a tokio runtime.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (side_effects, queue) = mpsc::unbounded_channel();
        tokio::spawn(side_effect_loop(queue));
        Arc::new(Self {
            events,
            side_effects,
        })
    }

    /// Feeds one lifecycle event into the broadcast. Platform glue calls
    /// this from its own lifecycle callbacks.
    pub fn publish(&self, event: LifecycleEvent) {
        // Send only fails when nobody subscribes, which is fine.
        let _ = self.events.send(event);
    }

    /// Subscribes to lifecycle events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Resolves with the next container-created event. Returns `None` only
    /// if the event channel is gone, which cannot happen while the context
    /// is alive.
    pub async fn next_created(&self) -> Option<ContainerHandle> {
        let mut events = self.subscribe();
        loop {
            match events.recv().await {
                Ok(LifecycleEvent::Created { container, .. }) => return Some(container),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Enqueues fire-and-forget work on the ordered side-effect queue.
    /// Units run one at a time in submission order; a fault in one unit is
    /// caught and logged and never aborts the consumer loop.
    pub fn submit_side_effect<F>(&self, work: F)
    where
        F: Future<Output = Result<(), SideEffectError>> + Send + 'static,
    {
        if self.side_effects.send(work.boxed()).is_err() {
            error!(target: "switchyard::cxt", "side-effect queue is gone; work dropped");
        }
    }
}

async fn side_effect_loop(mut queue: mpsc::UnboundedReceiver<SideEffect>) {
    while let Some(work) = queue.recv().await {
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(())) => debug!(target: "switchyard::cxt", "side effect complete"),
            Ok(Err(error)) => {
                error!(target: "switchyard::cxt", "side effect failed: {error}");
            }
            Err(_) => {
                error!(target: "switchyard::cxt", "side effect panicked; consumer continues");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::{Container, NavIdentity};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug)]
    struct Dummy;

    impl Container for Dummy {
        fn kind(&self) -> &str {
            "dummy"
        }

        fn request_close(&self) {}
    }

    #[tokio::test]
    async fn next_created_sees_created_events_only() {
        let cxt = RouteCxt::new();
        let waiter = {
            let cxt = Arc::clone(&cxt);
            tokio::spawn(async move { cxt.next_created().await })
        };
        // Give the waiter a chance to subscribe.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let handle: ContainerHandle = Arc::new(Dummy);
        cxt.publish(LifecycleEvent::Started(Arc::clone(&handle)));
        cxt.publish(LifecycleEvent::Created {
            container: Arc::clone(&handle),
            saved: None,
        });
        let created = waiter.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&created, &handle));
    }

    #[tokio::test]
    async fn side_effects_run_in_submission_order() {
        let cxt = RouteCxt::new();
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(vec![]));
        for i in 0..5 {
            let seen = Arc::clone(&seen);
            cxt.submit_side_effect(async move {
                // Later units sleep less; order must still hold.
                tokio::time::sleep(Duration::from_millis(5 - i as u64)).await;
                seen.lock().unwrap().push(i);
                Ok(())
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn faulted_side_effect_does_not_abort_the_loop() {
        let cxt = RouteCxt::new();
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(vec![]));
        cxt.submit_side_effect(async { Err("deliberate fault".into()) });
        cxt.submit_side_effect(async {
            assert!(1 == 2, "deliberate panic");
            Ok(())
        });
        {
            let seen = Arc::clone(&seen);
            cxt.submit_side_effect(async move {
                seen.lock().unwrap().push("survivor");
                Ok(())
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn identity_tokens_are_unique() {
        let a = NavIdentity::next();
        let b = NavIdentity::next();
        assert_ne!(a, b);
    }
}
