//! Observer traits the application implements.

use std::future::Future;

use async_trait::async_trait;

use crate::message::TopicMessage;

/// Receives the parsed messages of one topic subscription.
///
/// Invoked synchronously on the link's receive task, once per frame, in
/// arrival order. Long-running work should be handed off to another task.
///
/// Any `Fn(TopicMessage) + Send + Sync` closure is a handler:
///
/// ```
/// use bbtronic_realtime::{MessageHandler, TopicMessage};
///
/// let handler = |msg: TopicMessage| println!("got {}", msg.event);
/// handler.on_message(TopicMessage::new("userUpdate"));
/// ```
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: TopicMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(TopicMessage) + Send + Sync + 'static,
{
    fn on_message(&self, message: TopicMessage) {
        self(message);
    }
}

/// Application callback around automatic recovery.
///
/// `on_recovered` runs exactly once per successful reconnection, after every
/// durable subscription has been replayed. Use it to re-fetch state that may
/// have drifted while the channel was down.
///
/// `before_reconnect` runs before each scheduled automatic attempt, ahead of
/// the backoff delay. It defaults to doing nothing.
///
/// An async closure `|| async { ... }` implements only `on_recovered`; its
/// `before_reconnect` is the default no-op. Use [`hook_fns`] to supply both.
#[async_trait]
pub trait RecoveryHook: Send + Sync + 'static {
    async fn before_reconnect(&self) {}

    async fn on_recovered(&self);
}

#[async_trait]
impl<F, Fut> RecoveryHook for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_recovered(&self) {
        self().await;
    }
}

/// A [`RecoveryHook`] made of two async closures. Built by [`hook_fns`].
pub struct HookFns<B, A> {
    before: B,
    after: A,
}

/// Build a [`RecoveryHook`] that runs `before` ahead of each scheduled
/// attempt and `after` once the channel has recovered.
///
/// ```
/// use bbtronic_realtime::handler::hook_fns;
///
/// let _hook = hook_fns(
///     || async { println!("reconnecting...") },
///     || async { println!("back online") },
/// );
/// ```
pub fn hook_fns<B, BFut, A, AFut>(before: B, after: A) -> HookFns<B, A>
where
    B: Fn() -> BFut + Send + Sync + 'static,
    BFut: Future<Output = ()> + Send + 'static,
    A: Fn() -> AFut + Send + Sync + 'static,
    AFut: Future<Output = ()> + Send + 'static,
{
    HookFns { before, after }
}

#[async_trait]
impl<B, BFut, A, AFut> RecoveryHook for HookFns<B, A>
where
    B: Fn() -> BFut + Send + Sync + 'static,
    BFut: Future<Output = ()> + Send + 'static,
    A: Fn() -> AFut + Send + Sync + 'static,
    AFut: Future<Output = ()> + Send + 'static,
{
    async fn before_reconnect(&self) {
        (self.before)().await;
    }

    async fn on_recovered(&self) {
        (self.after)().await;
    }
}
