//! Automatic revalidation triggers: focus/online events, polling and retry.

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{RetryPolicy, Settings};

/// Application lifecycle transitions that revalidate observed keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The application regained focus.
    Focus,
    /// Network connectivity came back.
    Online,
}

impl LifecycleEvent {
    /// Whether consumers configured with `settings` react to this event.
    pub fn accepted_by(self, settings: &Settings) -> bool {
        match self {
            LifecycleEvent::Focus => settings.revalidate_on_focus,
            LifecycleEvent::Online => settings.revalidate_on_online,
        }
    }
}

/// Fan-out hub for [`LifecycleEvent`]s. Cloning shares the hub.
#[derive(Debug, Clone)]
pub struct LifecycleEvents {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        LifecycleEvents { sender }
    }

    /// Deliver `event` to every live consumer, returning how many received it.
    pub fn emit(&self, event: LifecycleEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LifecycleEvents {
    fn default() -> Self {
        Self::new(16)
    }
}

/// Call `tick` every `period` until `token` is cancelled. The first call
/// happens one period after start.
pub(crate) async fn run_interval<F, Fut>(period: Duration, token: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = interval.tick() => tick().await,
        }
    }
}

/// Call `on_event` for every accepted event until `token` is cancelled or the hub is gone.
pub(crate) async fn run_lifecycle<A, F, Fut>(
    mut events: broadcast::Receiver<LifecycleEvent>,
    token: CancellationToken,
    accept: A,
    mut on_event: F,
) where
    A: Fn(LifecycleEvent) -> bool,
    F: FnMut(LifecycleEvent) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            received = events.recv() => received,
        };

        match received {
            Ok(event) if accept(event) => on_event(event).await,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "lifecycle receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Retry with exponential backoff until `attempt` reports success, the policy
/// runs out of attempts or `token` is cancelled.
///
/// Returns whether a retry succeeded.
pub(crate) async fn run_backoff<F, Fut>(
    policy: RetryPolicy,
    token: CancellationToken,
    mut attempt: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for n in 0..policy.max_attempts {
        tokio::select! {
            biased;
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(policy.delay(n)) => {}
        }
        if attempt().await {
            return true;
        }
    }
    false
}
