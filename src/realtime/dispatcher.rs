//! Message Dispatcher
//!
//! Single responsibility: multiplex one connection into many correlated calls and
//! push subscriptions.
//!
//! # Ownership
//!
//! ```text
//!   callers ──call()/subscribe()──▶ Dispatcher ──send_text()──▶ FrameSender (mutex)
//!                                      ▲
//!                                      │ resolve / deliver / pong
//!                                      │
//!                              receive loop ◀──recv_text()── FrameReceiver (owned)
//! ```
//!
//! The receive loop is the only reader. It resolves pending calls by `id`, hands
//! `changed` frames to subscription queues by `fields.eventName`, and answers pings
//! from a task set so a slow write never delays the next read.
//!
//! When reading or decoding fails the loop records the error, fails every pending
//! call with it, stops all subscription delivery, and returns it. Nothing is read
//! from the connection afterwards.
//!
//! # Limitations
//!
//! There is no per-call timeout. A call whose response never arrives waits until
//! the connection fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, trace, warn};

use super::protocol::{self, IncomingFrame};
use super::transport::{FrameReceiver, FrameSender};
use crate::error::RealtimeError;

/// Default capacity of each subscription's delivery queue.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

type ResultSlot = oneshot::Sender<Result<Value, RealtimeError>>;

/// Routes frames of one connection. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    /// Write half; held for exactly one frame per lock
    sender: Mutex<Box<dyn FrameSender>>,
    tables: Mutex<Tables>,
    subscription_buffer: usize,
    /// Set once the receive loop has terminated; checked by delivery tasks
    closed: Arc<AtomicBool>,
    /// Read-held by a delivery task for each callback; write-taken by terminate
    delivery_gate: Arc<RwLock<()>>,
    shutdown: Notify,
}

#[derive(Default)]
struct Tables {
    pending: HashMap<String, ResultSlot>,
    /// Stream key → the subscription currently receiving it
    subscriptions: HashMap<String, Route>,
    terminal: Option<RealtimeError>,
}

struct Route {
    subscription_id: String,
    queue: mpsc::Sender<Value>,
}

impl Dispatcher {
    /// Create a dispatcher writing to `sender`.
    ///
    /// `subscription_buffer` bounds how many push frames may wait for one
    /// subscriber before further frames for it are dropped.
    pub fn new(sender: impl FrameSender, subscription_buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Box::new(sender)),
                tables: Mutex::new(Tables::default()),
                subscription_buffer: subscription_buffer.max(1),
                closed: Arc::new(AtomicBool::new(false)),
                delivery_gate: Arc::new(RwLock::new(())),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Start the receive loop on `receiver`.
    ///
    /// The returned task finishes only when the loop terminates, yielding the
    /// error that ended it.
    pub fn run(&self, receiver: impl FrameReceiver) -> JoinHandle<RealtimeError> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.receive_loop(Box::new(receiver)).await })
    }

    /// Send `message`, optionally waiting for the `result` frame correlated by
    /// `correlation_id`.
    ///
    /// Without an id this returns `Ok(None)` as soon as the frame is written.
    pub async fn call(
        &self,
        message: &Value,
        correlation_id: Option<&str>,
    ) -> Result<Option<Value>, RealtimeError> {
        match correlation_id {
            None => self.send(message).await.map(|()| None),
            Some(id) => self.request(message, id).await.map(Some),
        }
    }

    /// Fire-and-forget send.
    pub async fn send(&self, message: &Value) -> Result<(), RealtimeError> {
        let text = serde_json::to_string(message)
            .map_err(|e| RealtimeError::Internal(format!("Failed to encode frame: {}", e)))?;
        trace!(frame = %text, "Outgoing");
        self.inner.sender.lock().await.send_text(text).await
    }

    /// Send `message` and wait for the `result` frame whose `id` is `id`.
    ///
    /// The id must not collide with another outstanding call; if it does, the
    /// earlier caller is abandoned.
    pub async fn request(&self, message: &Value, id: &str) -> Result<Value, RealtimeError> {
        let (slot, response) = oneshot::channel();
        {
            let mut tables = self.inner.tables.lock().await;
            if let Some(error) = &tables.terminal {
                return Err(error.clone());
            }
            if tables.pending.insert(id.to_string(), slot).is_some() {
                warn!(id = %id, "Correlation id reused while still outstanding");
            }
        }

        if let Err(e) = self.send(message).await {
            self.inner.tables.lock().await.pending.remove(id);
            return Err(e);
        }

        match response.await {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::Internal(format!(
                "Call {} was abandoned before it resolved",
                id
            ))),
        }
    }

    /// Register `callback` for `changed` frames keyed by `stream_key`, then send
    /// the subscribe document.
    ///
    /// A later subscription on the same key replaces this one. The callback runs
    /// on its own task, so it may block without stalling other traffic, but
    /// frames arriving while its queue is full are dropped.
    pub async fn subscribe(
        &self,
        message: &Value,
        subscription_id: &str,
        stream_key: &str,
        callback: impl FnMut(Value) + Send + 'static,
    ) -> Result<(), RealtimeError> {
        let (tx, rx) = mpsc::channel(self.inner.subscription_buffer);
        {
            let mut tables = self.inner.tables.lock().await;
            if let Some(error) = &tables.terminal {
                return Err(error.clone());
            }
            let route = Route {
                subscription_id: subscription_id.to_string(),
                queue: tx.clone(),
            };
            if let Some(replaced) = tables.subscriptions.insert(stream_key.to_string(), route) {
                debug!(
                    stream_key = %stream_key,
                    replaced = %replaced.subscription_id,
                    "Replacing existing subscription"
                );
            }
        }

        spawn_delivery(
            stream_key.to_string(),
            Box::new(callback),
            rx,
            Arc::clone(&self.inner.closed),
            Arc::clone(&self.inner.delivery_gate),
        );

        if let Err(e) = self.send(message).await {
            let mut tables = self.inner.tables.lock().await;
            let ours = tables
                .subscriptions
                .get(stream_key)
                .is_some_and(|current| current.queue.same_channel(&tx));
            if ours {
                tables.subscriptions.remove(stream_key);
            }
            return Err(e);
        }

        debug!(stream_key = %stream_key, subscription_id = %subscription_id, "Subscription registered");
        Ok(())
    }

    /// Drop the callback registered for `stream_key`, but only while it still
    /// belongs to `subscription_id`.
    ///
    /// Returns whether a subscription was removed. A subscription that has been
    /// replaced by a newer one on the same key is left alone. Frames already
    /// queued for it are still delivered.
    pub async fn remove_subscription(&self, stream_key: &str, subscription_id: &str) -> bool {
        let mut tables = self.inner.tables.lock().await;
        let owned = tables
            .subscriptions
            .get(stream_key)
            .is_some_and(|route| route.subscription_id == subscription_id);
        if owned {
            tables.subscriptions.remove(stream_key);
        }
        debug!(
            stream_key = %stream_key,
            subscription_id = %subscription_id,
            removed = owned,
            "Subscription removed"
        );
        owned
    }

    /// Ask the receive loop to stop. Pending calls fail as if the connection had
    /// dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.notify_one();
    }

    /// Whether the receive loop has terminated.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The error that terminated the receive loop, if it has terminated.
    pub async fn terminal_error(&self) -> Option<RealtimeError> {
        self.inner.tables.lock().await.terminal.clone()
    }

    /// Number of correlated calls still waiting for a response.
    pub async fn pending_calls(&self) -> usize {
        self.inner.tables.lock().await.pending.len()
    }

    async fn receive_loop(self, mut receiver: Box<dyn FrameReceiver>) -> RealtimeError {
        debug!("Receive loop started");

        let mut keepalive: JoinSet<Result<(), RealtimeError>> = JoinSet::new();

        let terminal = loop {
            reap_keepalive(&mut keepalive);

            let next = tokio::select! {
                biased;
                _ = self.inner.shutdown.notified() => None,
                next = receiver.recv_text() => Some(next),
            };
            let Some(next) = next else {
                break RealtimeError::Transport("Connection shut down by client".into());
            };

            let text = match next {
                Ok(Some(text)) => text,
                Ok(None) => break RealtimeError::Transport("Connection closed by server".into()),
                Err(e) => break e,
            };
            trace!(frame = %text, "Incoming");

            match IncomingFrame::decode(&text) {
                Ok(frame) => self.dispatch(frame, &mut keepalive).await,
                Err(e) => break e,
            }
        };

        error!(error = %terminal, "Receive loop terminated");
        self.terminate(&terminal).await;
        reap_keepalive(&mut keepalive);

        terminal
    }

    async fn dispatch(
        &self,
        frame: IncomingFrame,
        keepalive: &mut JoinSet<Result<(), RealtimeError>>,
    ) {
        match frame {
            IncomingFrame::Result { id, frame } => {
                let slot = self.inner.tables.lock().await.pending.remove(&id);
                match slot {
                    Some(slot) => {
                        let _ = slot.send(Ok(frame));
                    }
                    None => debug!(id = %id, "Dropping result with no pending call"),
                }
            }
            IncomingFrame::Changed { event_name, frame } => {
                let tables = self.inner.tables.lock().await;
                let Some(route) = tables.subscriptions.get(&event_name) else {
                    trace!(stream_key = %event_name, "No subscription for push frame");
                    return;
                };
                match route.queue.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(stream_key = %event_name, "Subscriber queue full, dropping push frame");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(stream_key = %event_name, "Subscriber gone, dropping push frame");
                    }
                }
            }
            IncomingFrame::Lifecycle(_) => {}
            IncomingFrame::Ping => {
                let dispatcher = self.clone();
                keepalive.spawn(async move { dispatcher.send(&protocol::pong()).await });
            }
            IncomingFrame::Error(frame) => {
                let error = RealtimeError::Remote(frame.to_string());
                warn!(error = %error, "Server reported an error");
            }
            IncomingFrame::Unknown(frame) => {
                let error = RealtimeError::ProtocolViolation(frame.to_string());
                debug!(error = %error, "Ignoring unroutable frame");
            }
        }
    }

    async fn terminate(&self, error: &RealtimeError) {
        self.inner.closed.store(true, Ordering::Release);

        let pending = {
            let mut tables = self.inner.tables.lock().await;
            tables.terminal = Some(error.clone());
            tables.subscriptions.clear();
            std::mem::take(&mut tables.pending)
        };

        for (id, slot) in pending {
            debug!(id = %id, "Failing pending call");
            let _ = slot.send(Err(error.clone()));
        }

        // Wait out a callback that passed its closed check before the flag was set
        drop(self.inner.delivery_gate.write().await);
    }
}

/// Log the outcome of finished pong sends.
fn reap_keepalive(keepalive: &mut JoinSet<Result<(), RealtimeError>>) {
    while let Some(outcome) = keepalive.try_join_next() {
        match outcome {
            Ok(Ok(())) => trace!("Pong sent"),
            Ok(Err(e)) => warn!(error = %e, "Failed to send pong"),
            Err(e) => warn!(error = %e, "Pong task did not complete"),
        }
    }
}

/// Run `callback` for each frame queued on `rx` until the subscription is
/// dropped or the connection closes.
///
/// Each callback runs under a read hold of `gate`, and `closed` is checked
/// inside that hold. Termination sets `closed` and then takes the gate for
/// writing, so a callback already running when the loop dies delays the loop's
/// exit until it returns, and frames still queued are discarded.
fn spawn_delivery(
    stream_key: String,
    mut callback: Box<dyn FnMut(Value) + Send>,
    mut rx: mpsc::Receiver<Value>,
    closed: Arc<AtomicBool>,
    gate: Arc<RwLock<()>>,
) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let _running = gate.read().await;
            if closed.load(Ordering::Acquire) {
                break;
            }
            callback(frame);
        }
        debug!(stream_key = %stream_key, "Subscription delivery ended");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::protocol::{method_call, subscription_request};
    use crate::realtime::transport::{memory_pair, MemoryPeer};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn start() -> (Dispatcher, MemoryPeer, JoinHandle<RealtimeError>) {
        let (sender, receiver, peer) = memory_pair();
        let dispatcher = Dispatcher::new(sender, 16);
        let task = dispatcher.run(receiver);
        (dispatcher, peer, task)
    }

    fn spawn_request(
        dispatcher: &Dispatcher,
        id: &str,
    ) -> JoinHandle<Result<Value, RealtimeError>> {
        let dispatcher = dispatcher.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let message = method_call(&id, "test", json!([]));
            dispatcher.request(&message, &id).await
        })
    }

    fn result_frame(id: &str, payload: Value) -> Value {
        json!({"msg": "result", "id": id, "result": payload})
    }

    fn forwarding_callback() -> (
        impl FnMut(Value) + Send + 'static,
        mpsc::UnboundedReceiver<Value>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |frame| {
                let _ = tx.send(frame);
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_login_call_resolves_with_exact_frame() {
        let (dispatcher, mut peer, _task) = start();

        let call = spawn_request(&dispatcher, "1");
        let sent = peer.next_sent().await.unwrap();
        assert_eq!(sent["id"], "1");
        assert_eq!(sent["msg"], "method");

        let reply = result_frame("1", json!({"id": "u1", "token": "t"}));
        peer.push(reply.clone());

        let resolved = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
        assert_eq!(resolved, reply);
        assert_eq!(dispatcher.pending_calls().await, 0);
    }

    #[tokio::test]
    async fn test_calls_resolve_in_arrival_order_not_send_order() {
        let (dispatcher, mut peer, _task) = start();

        let first = spawn_request(&dispatcher, "1");
        peer.next_sent().await.unwrap();
        let second = spawn_request(&dispatcher, "2");
        peer.next_sent().await.unwrap();

        peer.push(result_frame("2", json!("two")));
        peer.push(result_frame("1", json!("one")));

        let second = timeout(WAIT, second).await.unwrap().unwrap().unwrap();
        let first = timeout(WAIT, first).await.unwrap().unwrap().unwrap();
        assert_eq!(first["result"], "one");
        assert_eq!(second["result"], "two");
    }

    #[tokio::test]
    async fn test_many_concurrent_calls_each_get_their_own_result() {
        let (dispatcher, mut peer, _task) = start();

        let calls: Vec<_> = (0..32)
            .map(|n| (n, spawn_request(&dispatcher, &n.to_string())))
            .collect();
        for _ in 0..32 {
            peer.next_sent().await.unwrap();
        }

        for n in (0..32).rev() {
            peer.push(result_frame(&n.to_string(), json!(n)));
        }

        for (n, call) in calls {
            let frame = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
            assert_eq!(frame["id"], n.to_string());
            assert_eq!(frame["result"], n);
        }
        assert_eq!(dispatcher.pending_calls().await, 0);
    }

    #[tokio::test]
    async fn test_result_for_unknown_id_is_dropped() {
        let (dispatcher, mut peer, task) = start();

        let call = spawn_request(&dispatcher, "1");
        peer.next_sent().await.unwrap();

        peer.push(result_frame("stale", json!(null)));
        peer.push(result_frame("1", json!("ok")));

        let frame = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
        assert_eq!(frame["result"], "ok");
        assert!(!task.is_finished());
        assert!(!dispatcher.is_closed());
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_without_response() {
        let (dispatcher, mut peer, _task) = start();

        let outcome = dispatcher
            .call(&json!({"msg": "connect"}), None)
            .await
            .unwrap();
        assert_eq!(outcome, None);
        assert_eq!(peer.next_sent().await, Some(json!({"msg": "connect"})));
        assert_eq!(dispatcher.pending_calls().await, 0);
    }

    #[tokio::test]
    async fn test_changed_frames_reach_only_matching_subscription() {
        let (dispatcher, mut peer, _task) = start();
        let (callback, mut delivered) = forwarding_callback();

        let message = subscription_request("s1", "stream-room-messages", json!(["room42"]));
        dispatcher.subscribe(&message, "s1", "room42", callback).await.unwrap();
        assert_eq!(peer.next_sent().await.unwrap()["name"], "stream-room-messages");

        peer.push(json!({"msg": "changed", "fields": {"eventName": "room42", "seq": 1}}));
        peer.push(json!({"msg": "changed", "fields": {"eventName": "room99", "seq": 2}}));
        peer.push(json!({"msg": "changed", "fields": {"eventName": "room42", "seq": 3}}));

        let first = timeout(WAIT, delivered.recv()).await.unwrap().unwrap();
        let second = timeout(WAIT, delivered.recv()).await.unwrap().unwrap();
        assert_eq!(first["fields"]["seq"], 1);
        assert_eq!(second["fields"]["seq"], 3);
        assert!(timeout(Duration::from_millis(100), delivered.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_callback() {
        let (dispatcher, mut peer, _task) = start();
        let (old_callback, mut old_delivered) = forwarding_callback();
        let (new_callback, mut new_delivered) = forwarding_callback();

        let message = subscription_request("s1", "stream-room-messages", json!(["room42"]));
        dispatcher.subscribe(&message, "s1", "room42", old_callback).await.unwrap();
        dispatcher.subscribe(&message, "s2", "room42", new_callback).await.unwrap();
        peer.next_sent().await.unwrap();
        peer.next_sent().await.unwrap();

        peer.push(json!({"msg": "changed", "fields": {"eventName": "room42"}}));

        assert!(timeout(WAIT, new_delivered.recv()).await.unwrap().is_some());
        assert!(timeout(WAIT, old_delivered.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_removed_subscription_stops_delivery() {
        let (dispatcher, mut peer, _task) = start();
        let (callback, mut delivered) = forwarding_callback();

        let message = subscription_request("s1", "stream-room-messages", json!(["room42"]));
        dispatcher.subscribe(&message, "s1", "room42", callback).await.unwrap();
        peer.next_sent().await.unwrap();

        assert!(dispatcher.remove_subscription("room42", "s1").await);
        assert!(!dispatcher.remove_subscription("room42", "s1").await);

        peer.push(json!({"msg": "changed", "fields": {"eventName": "room42"}}));
        assert!(timeout(WAIT, delivered.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_removing_replaced_subscription_keeps_replacement() {
        let (dispatcher, mut peer, _task) = start();
        let (old_callback, _old_delivered) = forwarding_callback();
        let (new_callback, mut new_delivered) = forwarding_callback();

        let first = subscription_request("s1", "stream-room-messages", json!(["room42"]));
        let second = subscription_request("s2", "stream-room-messages", json!(["room42"]));
        dispatcher.subscribe(&first, "s1", "room42", old_callback).await.unwrap();
        dispatcher.subscribe(&second, "s2", "room42", new_callback).await.unwrap();
        peer.next_sent().await.unwrap();
        peer.next_sent().await.unwrap();

        assert!(!dispatcher.remove_subscription("room42", "s1").await);

        peer.push(json!({"msg": "changed", "fields": {"eventName": "room42", "seq": 1}}));
        let frame = timeout(WAIT, new_delivered.recv()).await.unwrap().unwrap();
        assert_eq!(frame["fields"]["seq"], 1);

        assert!(dispatcher.remove_subscription("room42", "s2").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_termination_waits_for_running_callback_and_drops_queued_frames() {
        let (dispatcher, mut peer, mut task) = start();

        let (entered_tx, mut entered) = mpsc::unbounded_channel();
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let callback = move |frame: Value| {
            let _ = entered_tx.send(());
            let _ = gate.recv();
            let _ = seen_tx.send(frame);
        };

        let message = subscription_request("s1", "stream-room-messages", json!(["room42"]));
        dispatcher.subscribe(&message, "s1", "room42", callback).await.unwrap();
        peer.next_sent().await.unwrap();

        peer.push(json!({"msg": "changed", "fields": {"eventName": "room42", "seq": 1}}));
        peer.push(json!({"msg": "changed", "fields": {"eventName": "room42", "seq": 2}}));
        timeout(WAIT, entered.recv()).await.unwrap().unwrap();

        peer.fail(RealtimeError::Transport("connection reset".into()));
        assert!(timeout(Duration::from_millis(100), &mut task).await.is_err());

        release.send(()).unwrap();
        timeout(WAIT, task).await.unwrap().unwrap();

        let first = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
        assert_eq!(first["fields"]["seq"], 1);
        assert!(timeout(WAIT, seen.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_each_ping_gets_one_pong() {
        let (_dispatcher, mut peer, _task) = start();

        peer.push(json!({"msg": "ping"}));
        peer.push(json!({"msg": "ping"}));

        assert_eq!(timeout(WAIT, peer.next_sent()).await.unwrap(), Some(json!({"msg": "pong"})));
        assert_eq!(timeout(WAIT, peer.next_sent()).await.unwrap(), Some(json!({"msg": "pong"})));
        assert!(timeout(Duration::from_millis(100), peer.next_sent()).await.is_err());
    }

    /// Holds back pong frames until released.
    struct GatedSender {
        tx: mpsc::UnboundedSender<String>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl FrameSender for GatedSender {
        async fn send_text(&mut self, text: String) -> Result<(), RealtimeError> {
            if text.contains("\"pong\"") {
                self.gate.notified().await;
            }
            self.tx
                .send(text)
                .map_err(|_| RealtimeError::Transport("closed".into()))
        }
    }

    #[tokio::test]
    async fn test_slow_pong_does_not_block_reading() {
        let (_unused, receiver, peer) = memory_pair();
        let (tx, mut written) = mpsc::unbounded_channel();
        let gate = Arc::new(Notify::new());
        let dispatcher = Dispatcher::new(
            GatedSender {
                tx,
                gate: Arc::clone(&gate),
            },
            16,
        );
        let _task = dispatcher.run(receiver);

        let call = spawn_request(&dispatcher, "1");
        assert!(written.recv().await.unwrap().contains("\"method\""));

        peer.push(json!({"msg": "ping"}));
        peer.push(result_frame("1", json!("ok")));

        let frame = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
        assert_eq!(frame["result"], "ok");

        gate.notify_one();
        let pong = timeout(WAIT, written.recv()).await.unwrap().unwrap();
        assert_eq!(pong, r#"{"msg":"pong"}"#);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocked_subscriber_does_not_stall_calls() {
        let (sender, receiver, mut peer) = memory_pair();
        let dispatcher = Dispatcher::new(sender, 1);
        let _task = dispatcher.run(receiver);

        let (release, gate) = std::sync::mpsc::channel::<()>();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let callback = move |frame: Value| {
            let _ = gate.recv();
            let _ = seen_tx.send(frame);
        };

        let message = subscription_request("s1", "stream-room-messages", json!(["room42"]));
        dispatcher.subscribe(&message, "s1", "room42", callback).await.unwrap();
        peer.next_sent().await.unwrap();

        for seq in 0..8 {
            peer.push(json!({"msg": "changed", "fields": {"eventName": "room42", "seq": seq}}));
        }

        let call = spawn_request(&dispatcher, "1");
        peer.next_sent().await.unwrap();
        peer.push(result_frame("1", json!("ok")));
        let frame = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
        assert_eq!(frame["result"], "ok");

        for _ in 0..8 {
            let _ = release.send(());
        }
        let first = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
        assert_eq!(first["fields"]["seq"], 0);
    }

    #[tokio::test]
    async fn test_error_frame_is_not_propagated() {
        let (dispatcher, mut peer, task) = start();

        let call = spawn_request(&dispatcher, "1");
        peer.next_sent().await.unwrap();

        peer.push(json!({"msg": "error", "reason": "Bad request"}));
        peer.push(json!({"msg": "surprise"}));
        peer.push(json!({"msg": "ready", "subs": ["s1"]}));
        peer.push(result_frame("1", json!("ok")));

        let frame = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
        assert_eq!(frame["result"], "ok");
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_io_error_fails_pending_call_with_same_error() {
        let (dispatcher, mut peer, task) = start();

        let resolved = spawn_request(&dispatcher, "4");
        peer.next_sent().await.unwrap();
        peer.push(result_frame("4", json!("done")));
        let resolved = timeout(WAIT, resolved).await.unwrap().unwrap();

        let pending = spawn_request(&dispatcher, "5");
        peer.next_sent().await.unwrap();

        let failure = RealtimeError::Transport("connection reset".into());
        peer.fail(failure.clone());

        let outcome = timeout(WAIT, pending).await.unwrap().unwrap();
        assert_eq!(outcome, Err(failure.clone()));
        assert_eq!(timeout(WAIT, task).await.unwrap().unwrap(), failure);
        assert_eq!(resolved.unwrap()["result"], "done");
        assert_eq!(dispatcher.terminal_error().await, Some(failure));
    }

    #[tokio::test]
    async fn test_undecodable_frame_terminates_loop() {
        let (dispatcher, mut peer, task) = start();

        let pending = spawn_request(&dispatcher, "1");
        peer.next_sent().await.unwrap();
        peer.push_text("{not json");

        let outcome = timeout(WAIT, pending).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(RealtimeError::Decode(_))));
        assert!(matches!(task.await.unwrap(), RealtimeError::Decode(_)));
        assert!(dispatcher.is_closed());
    }

    #[tokio::test]
    async fn test_calls_after_termination_fail_immediately() {
        let (dispatcher, mut peer, task) = start();

        peer.close();
        let terminal = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(terminal, RealtimeError::Transport(_)));

        let message = method_call("9", "test", json!([]));
        assert_eq!(dispatcher.request(&message, "9").await, Err(terminal.clone()));

        let (callback, _delivered) = forwarding_callback();
        let sub = subscription_request("s1", "stream-room-messages", json!(["room42"]));
        assert_eq!(
            dispatcher.subscribe(&sub, "s1", "room42", callback).await,
            Err(terminal)
        );
    }

    #[tokio::test]
    async fn test_send_failure_leaves_no_pending_entry() {
        let (dispatcher, mut peer, _task) = start();
        peer.hang_up();

        let message = method_call("1", "test", json!([]));
        let outcome = dispatcher.request(&message, "1").await;
        assert!(matches!(outcome, Err(RealtimeError::Transport(_))));
        assert_eq!(dispatcher.pending_calls().await, 0);

        let (callback, _delivered) = forwarding_callback();
        let sub = subscription_request("s1", "stream-room-messages", json!(["room42"]));
        assert!(dispatcher.subscribe(&sub, "s1", "room42", callback).await.is_err());
        assert!(!dispatcher.remove_subscription("room42", "s1").await);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_calls() {
        let (dispatcher, mut peer, task) = start();

        let pending = spawn_request(&dispatcher, "1");
        peer.next_sent().await.unwrap();

        dispatcher.shutdown();

        let outcome = timeout(WAIT, pending).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(RealtimeError::Transport(_))));
        assert!(task.await.is_ok());
    }
}
