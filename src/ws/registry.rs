//! Topic multiplexing over the single channel connection.
//!
//! Any number of local handlers may subscribe to the same topic; the server
//! sees at most one subscription per topic. The registry sends a subscribe
//! frame only on the 0→1 handler transition and an unsubscribe frame only on
//! the 1→0 transition. Because the server holds no subscription state across
//! disconnects, every active topic is re-subscribed on each `Open`, which
//! also covers handlers registered before the socket first opens.

use crate::ws::{ClientFrame, ServerFrame, Transport, TransportEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub type TopicHandler = Arc<dyn Fn(&Value) + Send + Sync>;

struct RegistryInner {
    transport: Arc<dyn Transport>,
    topics: Mutex<HashMap<String, HashMap<u64, TopicHandler>>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct TopicRegistry {
    inner: Arc<RegistryInner>,
}

impl TopicRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a handler for a topic. The first subscribe lazily triggers
    /// the transport connection. Returns a guard; dropping it (or calling
    /// `unsubscribe`) deregisters the handler synchronously.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut topics = self.inner.topics.lock().expect("topic table poisoned");
            let handlers = topics.entry(topic.to_string()).or_default();
            handlers.insert(id, Arc::new(handler));
            handlers.len() == 1
        };

        self.inner.transport.connect();
        if first {
            debug!(topic = topic, "wiring topic to transport");
            self.inner.transport.send_frame(ClientFrame::Subscribe {
                channel: topic.to_string(),
            });
        }

        Subscription {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            id,
            active: true,
        }
    }

    /// Spawn the dispatch task pumping transport events into handlers.
    pub fn spawn_dispatch(
        &self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                registry.handle_transport_event(event);
            }
        })
    }

    pub(crate) fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.resubscribe_all(),
            TransportEvent::Closed => debug!("channel closed, awaiting reconnect"),
            TransportEvent::Exhausted => warn!("channel reconnect attempts exhausted"),
            TransportEvent::Frame(ServerFrame::Update { channel, data }) => {
                self.dispatch(&channel, &data)
            }
            TransportEvent::Frame(ServerFrame::Pong) => {}
        }
    }

    /// Subscriptions are session-scoped on the server side: re-send every
    /// active topic after each transition into `Open`.
    fn resubscribe_all(&self) {
        let topics: Vec<String> = {
            let table = self.inner.topics.lock().expect("topic table poisoned");
            table.keys().cloned().collect()
        };
        debug!(topics = topics.len(), "resubscribing active topics");
        for topic in topics {
            self.inner
                .transport
                .send_frame(ClientFrame::Subscribe { channel: topic });
        }
    }

    /// Deliver an update to every handler registered for the topic.
    /// Membership is re-checked per handler so an unsubscribe that raced this
    /// frame is honored, and a panicking handler cannot block its siblings.
    fn dispatch(&self, channel: &str, data: &Value) {
        let ids: Vec<u64> = {
            let table = self.inner.topics.lock().expect("topic table poisoned");
            match table.get(channel) {
                Some(handlers) => handlers.keys().copied().collect(),
                None => {
                    debug!(channel = channel, "update for topic with no handlers");
                    return;
                }
            }
        };

        for id in ids {
            let handler = {
                let table = self.inner.topics.lock().expect("topic table poisoned");
                table.get(channel).and_then(|h| h.get(&id)).cloned()
            };
            let Some(handler) = handler else { continue };
            if catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
                error!(channel = channel, "handler panicked during dispatch");
            }
        }
    }

    #[cfg(test)]
    fn handler_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .expect("topic table poisoned")
            .get(topic)
            .map(|h| h.len())
            .unwrap_or(0)
    }
}

/// Handle for one registered handler. Unsubscribing is synchronous: the
/// handler is never invoked again once this returns, and the transport-level
/// unsubscribe is sent when the last handler for the topic goes away.
pub struct Subscription {
    inner: Arc<RegistryInner>,
    topic: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        let last = {
            let mut topics = self.inner.topics.lock().expect("topic table poisoned");
            match topics.get_mut(&self.topic) {
                Some(handlers) => {
                    handlers.remove(&self.id);
                    if handlers.is_empty() {
                        topics.remove(&self.topic);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last {
            debug!(topic = %self.topic, "unwiring topic from transport");
            self.inner.transport.send_frame(ClientFrame::Unsubscribe {
                channel: self.topic.clone(),
            });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingTransport {
        frames: Mutex<Vec<ClientFrame>>,
        connects: AtomicUsize,
    }

    impl RecordingTransport {
        fn frames(&self) -> Vec<ClientFrame> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl Transport for RecordingTransport {
        fn connect(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn send_frame(&self, frame: ClientFrame) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    fn subscribe_frame(topic: &str) -> ClientFrame {
        ClientFrame::Subscribe {
            channel: topic.to_string(),
        }
    }

    fn unsubscribe_frame(topic: &str) -> ClientFrame {
        ClientFrame::Unsubscribe {
            channel: topic.to_string(),
        }
    }

    #[test]
    fn test_reference_counted_wiring() {
        let transport = Arc::new(RecordingTransport::default());
        let registry = TopicRegistry::new(transport.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = hits.clone();
        let h2 = hits.clone();

        let sub_a = registry.subscribe("fixture:9", move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let sub_b = registry.subscribe("fixture:9", move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        });

        // Only the 0→1 transition reaches the transport.
        assert_eq!(transport.frames(), vec![subscribe_frame("fixture:9")]);

        sub_a.unsubscribe();
        // Still one handler: no unsubscribe frame yet, dispatch still works.
        assert_eq!(transport.frames(), vec![subscribe_frame("fixture:9")]);
        registry.dispatch("fixture:9", &serde_json::json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        sub_b.unsubscribe();
        assert_eq!(
            transport.frames(),
            vec![subscribe_frame("fixture:9"), unsubscribe_frame("fixture:9")]
        );
        assert_eq!(registry.handler_count("fixture:9"), 0);
    }

    #[test]
    fn test_drop_releases_subscription() {
        let transport = Arc::new(RecordingTransport::default());
        let registry = TopicRegistry::new(transport.clone());

        {
            let _sub = registry.subscribe("oddyssey:cycle:3", |_| {});
        }

        assert_eq!(
            transport.frames(),
            vec![
                subscribe_frame("oddyssey:cycle:3"),
                unsubscribe_frame("oddyssey:cycle:3")
            ]
        );
    }

    #[test]
    fn test_resubscribes_on_every_open() {
        let transport = Arc::new(RecordingTransport::default());
        let registry = TopicRegistry::new(transport.clone());

        let _sub = registry.subscribe("slip:placed:user:0xabc", |_| {});
        registry.handle_transport_event(TransportEvent::Open);
        registry.handle_transport_event(TransportEvent::Closed);
        registry.handle_transport_event(TransportEvent::Open);

        let frames = transport.frames();
        let subscribes = frames
            .iter()
            .filter(|f| matches!(f, ClientFrame::Subscribe { .. }))
            .count();
        // One eager send at subscribe time plus one per Open.
        assert_eq!(subscribes, 3);
    }

    #[test]
    fn test_panicking_handler_does_not_block_siblings() {
        let transport = Arc::new(RecordingTransport::default());
        let registry = TopicRegistry::new(transport);

        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();

        let _bad = registry.subscribe("fixture:1", |_| panic!("boom"));
        let _good = registry.subscribe("fixture:1", move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        registry.handle_transport_event(TransportEvent::Frame(ServerFrame::Update {
            channel: "fixture:1".to_string(),
            data: serde_json::json!({}),
        }));

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_ignores_unknown_topic() {
        let transport = Arc::new(RecordingTransport::default());
        let registry = TopicRegistry::new(transport);
        // Must not panic.
        registry.dispatch("fixture:404", &serde_json::json!({}));
    }

    #[test]
    fn test_subscribe_triggers_lazy_connect() {
        let transport = Arc::new(RecordingTransport::default());
        let registry = TopicRegistry::new(transport.clone());
        let _sub = registry.subscribe("fixture:2", |_| {});
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }
}
