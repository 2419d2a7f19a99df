//! Session event fan-out.
//!
//! Every notification goes to three sinks that never share delivery state:
//! in-process subscribers (called inline, failures logged), the topic bus
//! (one unbounded queue per subscription, no history) and, when configured, an
//! external push channel. The external sink is fed through a bounded queue
//! drained by its own worker, so a slow or dead remote never holds up the
//! first two sinks or the command that triggered the event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::async_trait;
use serenity::model::id::GuildId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PushError;
use crate::metrics::METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "player.created")]
    PlayerCreated,
    #[serde(rename = "player.destroyed")]
    PlayerDestroyed,
    #[serde(rename = "player.state")]
    PlayerState,
    #[serde(rename = "track.started")]
    TrackStarted,
    #[serde(rename = "track.queued")]
    TrackQueued,
    #[serde(rename = "track.ended")]
    TrackEnded,
    #[serde(rename = "queue.cleared")]
    QueueCleared,
    #[serde(rename = "volume.changed")]
    VolumeChanged,
    #[serde(rename = "shuffle.toggled")]
    ShuffleToggled,
    #[serde(rename = "repeat.changed")]
    RepeatChanged,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlayerCreated => "player.created",
            Self::PlayerDestroyed => "player.destroyed",
            Self::PlayerState => "player.state",
            Self::TrackStarted => "track.started",
            Self::TrackQueued => "track.queued",
            Self::TrackEnded => "track.ended",
            Self::QueueCleared => "queue.cleared",
            Self::VolumeChanged => "volume.changed",
            Self::ShuffleToggled => "shuffle.toggled",
            Self::RepeatChanged => "repeat.changed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationMessage<T> {
    pub id: Uuid,
    pub guild_id: GuildId,
    pub event_type: EventType,
    pub payload: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> NotificationMessage<T> {
    pub fn new(guild_id: GuildId, event_type: EventType, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            guild_id,
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// The form every sink receives.
pub type Notification = NotificationMessage<serde_json::Value>;

pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, message: &Notification) -> anyhow::Result<()>;
}

impl<F> EventSubscriber for F
where
    F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, message: &Notification) -> anyhow::Result<()> {
        self(message)
    }
}

/// In-process pub/sub keyed by event type. Every subscription owns an
/// unbounded queue, so a slow reader falls behind but never loses messages.
#[derive(Default)]
pub struct EventBus {
    topics: RwLock<HashMap<EventType, Vec<mpsc::UnboundedSender<Arc<Notification>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: EventType) -> mpsc::UnboundedReceiver<Arc<Notification>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = match self.topics.write() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics.entry(topic).or_default().push(tx);
        rx
    }

    /// Drop `receiver` and forget the topic once nobody listens to it.
    pub fn unsubscribe(
        &self,
        topic: EventType,
        receiver: mpsc::UnboundedReceiver<Arc<Notification>>,
    ) {
        drop(receiver);
        if let Ok(mut topics) = self.topics.write()
            && let Some(senders) = topics.get_mut(&topic)
        {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                topics.remove(&topic);
            }
        }
    }

    /// Returns how many subscribers had the message queued. Subscriptions
    /// whose receiver is gone are pruned here.
    pub fn publish(&self, message: Arc<Notification>) -> usize {
        let mut topics = match self.topics.write() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(senders) = topics.get_mut(&message.event_type) else {
            return 0;
        };
        let before = senders.len();
        senders.retain(|tx| tx.send(message.clone()).is_ok());
        let delivered = senders.len();
        if delivered < before {
            debug!(
                event = message.event_type.as_str(),
                "dropped {} closed bus subscription(s)",
                before - delivered
            );
        }
        if senders.is_empty() {
            topics.remove(&message.event_type);
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: EventType) -> usize {
        self.topics
            .read()
            .map(|topics| {
                topics
                    .get(&topic)
                    .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            })
            .unwrap_or(0)
    }
}

/// Remote real-time channel (webhook, socket hub, ...).
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn connect(&self) -> Result<(), PushError>;
    async fn invoke(&self, method: &str, message: &Notification) -> Result<(), PushError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ExternalSinkOptions {
    pub queue_capacity: usize,
    pub timeout: Duration,
    pub reconnect_interval: Duration,
}

impl Default for ExternalSinkOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalDelivery {
    NotConfigured,
    /// Sink is disconnected; message skipped.
    Disabled,
    Queued,
    /// Worker is behind; message dropped.
    Dropped,
}

pub struct ExternalSink {
    channel: Arc<dyn PushChannel>,
    enabled: AtomicBool,
    tx: mpsc::Sender<Arc<Notification>>,
    timeout: Duration,
}

impl ExternalSink {
    /// Spawn the delivery worker and the reconnect loop. The sink starts
    /// disabled; the reconnect loop's first tick makes the initial attempt.
    pub fn start(
        channel: Arc<dyn PushChannel>,
        options: ExternalSinkOptions,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let sink = Arc::new(Self {
            channel,
            enabled: AtomicBool::new(false),
            tx,
            timeout: options.timeout,
        });
        tokio::spawn(sink.clone().run_worker(rx, shutdown.clone()));
        tokio::spawn(
            sink.clone()
                .run_reconnect(options.reconnect_interval, shutdown),
        );
        sink
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        METRICS.set_external_enabled(enabled);
    }

    pub async fn connect(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.channel.connect()).await {
            Ok(Ok(())) => {
                if !self.enabled.swap(true, Ordering::AcqRel) {
                    info!("external push channel connected");
                }
                METRICS.set_external_enabled(true);
                true
            }
            Ok(Err(e)) => {
                debug!("external push channel connect failed: {e}");
                false
            }
            Err(_) => {
                debug!("external push channel connect timed out");
                false
            }
        }
    }

    fn offer(&self, message: Arc<Notification>) -> ExternalDelivery {
        if !self.is_enabled() {
            return ExternalDelivery::Disabled;
        }
        match self.tx.try_send(message) {
            Ok(()) => ExternalDelivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                METRICS.inc_external_dropped();
                ExternalDelivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => ExternalDelivery::Disabled,
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Arc<Notification>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(m) => m,
                    None => break,
                },
            };
            if !self.is_enabled() {
                continue;
            }
            let sent = tokio::time::timeout(
                self.timeout,
                self.channel.invoke(message.event_type.as_str(), &message),
            )
            .await;
            let failure = match sent {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => PushError::Timeout.to_string(),
            };
            warn!(
                event = message.event_type.as_str(),
                "external push failed, disabling sink until reconnect: {failure}"
            );
            self.set_enabled(false);
        }
    }

    async fn run_reconnect(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if !self.is_enabled() {
                        self.connect().await;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub local: usize,
    pub local_failed: usize,
    pub bus: usize,
    pub external: ExternalDelivery,
}

struct HubInner {
    subscribers: RwLock<Vec<(SubscriberId, Arc<dyn EventSubscriber>)>>,
    next_id: AtomicU64,
    bus: EventBus,
    external: Option<Arc<ExternalSink>>,
}

#[derive(Clone)]
pub struct NotificationHub {
    inner: Arc<HubInner>,
}

impl NotificationHub {
    pub fn new(external: Option<Arc<ExternalSink>>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                bus: EventBus::new(),
                external,
            }),
        }
    }

    pub fn subscribe_local(&self, subscriber: impl EventSubscriber + 'static) -> SubscriberId {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut subs) = self.inner.subscribers.write() {
            subs.push((id, Arc::new(subscriber)));
        }
        id
    }

    pub fn unsubscribe_local(&self, id: SubscriberId) -> bool {
        self.inner
            .subscribers
            .write()
            .map(|mut subs| {
                let before = subs.len();
                subs.retain(|(sid, _)| *sid != id);
                subs.len() != before
            })
            .unwrap_or(false)
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn external(&self) -> Option<&Arc<ExternalSink>> {
        self.inner.external.as_ref()
    }

    /// Never blocks on the external sink and never fails.
    pub fn notify<T: Serialize>(
        &self,
        guild_id: GuildId,
        event_type: EventType,
        payload: &T,
    ) -> Delivery {
        let payload = serde_json::to_value(payload).unwrap_or_else(|e| {
            error!(event = event_type.as_str(), "failed to serialize notification payload: {e}");
            serde_json::Value::Null
        });
        self.dispatch(Arc::new(NotificationMessage::new(guild_id, event_type, payload)))
    }

    pub fn dispatch(&self, message: Arc<Notification>) -> Delivery {
        METRICS.inc_notifications();

        let subscribers: Vec<_> = self
            .inner
            .subscribers
            .read()
            .map(|subs| subs.clone())
            .unwrap_or_default();
        let mut local = 0;
        let mut local_failed = 0;
        for (id, subscriber) in subscribers {
            match subscriber.on_event(&message) {
                Ok(()) => local += 1,
                Err(e) => {
                    local_failed += 1;
                    warn!(
                        subscriber = id.0,
                        event = message.event_type.as_str(),
                        "local subscriber failed: {e:#}"
                    );
                }
            }
        }

        let bus = self.inner.bus.publish(message.clone());

        let external = match &self.inner.external {
            Some(sink) => sink.offer(message),
            None => ExternalDelivery::NotConfigured,
        };

        Delivery {
            local,
            local_failed,
            bus,
            external,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct FakePush {
        connect_ok: AtomicBool,
        invoke_ok: AtomicBool,
        hang: AtomicBool,
        connects: AtomicUsize,
        invokes: AtomicUsize,
    }

    #[async_trait]
    impl PushChannel for FakePush {
        async fn connect(&self) -> Result<(), PushError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.connect_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(PushError::NotConnected)
            }
        }

        async fn invoke(&self, _method: &str, _message: &Notification) -> Result<(), PushError> {
            self.invokes.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.invoke_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(PushError::Transport("boom".into()))
            }
        }
    }

    fn options() -> ExternalSinkOptions {
        ExternalSinkOptions {
            queue_capacity: 4,
            timeout: Duration::from_millis(50),
            reconnect_interval: Duration::from_millis(20),
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn counting_subscriber(hits: Arc<AtomicUsize>) -> impl EventSubscriber {
        move |_: &Notification| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_locally_when_external_never_connected() {
        let push = Arc::new(FakePush::default());
        let sink = ExternalSink::start(push.clone(), options(), CancellationToken::new());
        let hub = NotificationHub::new(Some(sink));
        let hits = Arc::new(AtomicUsize::new(0));
        hub.subscribe_local(counting_subscriber(hits.clone()));
        let mut rx = hub.bus().subscribe(EventType::TrackStarted);

        let d = hub.notify(GuildId::new(1), EventType::TrackStarted, &"song");
        assert_eq!(d.local, 1);
        assert_eq!(d.bus, 1);
        assert_eq!(d.external, ExternalDelivery::Disabled);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, serde_json::json!("song"));
        assert_eq!(push.invokes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_stop_others() {
        let hub = NotificationHub::new(None);
        let hits = Arc::new(AtomicUsize::new(0));
        hub.subscribe_local(|_: &Notification| -> anyhow::Result<()> {
            anyhow::bail!("subscriber broke")
        });
        hub.subscribe_local(counting_subscriber(hits.clone()));

        let d = hub.notify(GuildId::new(1), EventType::VolumeChanged, &150);
        assert_eq!(d.local, 1);
        assert_eq!(d.local_failed, 1);
        assert_eq!(d.external, ExternalDelivery::NotConfigured);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_failure_disables_sink_then_reconnect_restores_it() {
        let push = Arc::new(FakePush::default());
        push.connect_ok.store(true, Ordering::SeqCst);
        let sink = ExternalSink::start(push.clone(), options(), CancellationToken::new());
        let hub = NotificationHub::new(Some(sink.clone()));
        wait_until(|| sink.is_enabled()).await;

        push.connect_ok.store(false, Ordering::SeqCst);
        assert_eq!(
            hub.notify(GuildId::new(1), EventType::TrackQueued, &1).external,
            ExternalDelivery::Queued
        );
        wait_until(|| !sink.is_enabled()).await;
        assert_eq!(
            hub.notify(GuildId::new(1), EventType::TrackQueued, &2).external,
            ExternalDelivery::Disabled
        );
        assert_eq!(push.invokes.load(Ordering::SeqCst), 1);

        push.connect_ok.store(true, Ordering::SeqCst);
        wait_until(|| sink.is_enabled()).await;
    }

    #[tokio::test]
    async fn hung_external_sink_does_not_block_notify() {
        let push = Arc::new(FakePush::default());
        push.connect_ok.store(true, Ordering::SeqCst);
        push.hang.store(true, Ordering::SeqCst);
        let sink = ExternalSink::start(push.clone(), options(), CancellationToken::new());
        let hub = NotificationHub::new(Some(sink.clone()));
        wait_until(|| sink.is_enabled()).await;
        let hits = Arc::new(AtomicUsize::new(0));
        hub.subscribe_local(counting_subscriber(hits.clone()));

        let burst = tokio::time::timeout(Duration::from_millis(100), async {
            for i in 0..20 {
                hub.notify(GuildId::new(1), EventType::PlayerState, &i);
            }
        })
        .await;
        assert!(burst.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn bus_unsubscribe_forgets_empty_topic() {
        let bus = EventBus::new();
        let rx = bus.subscribe(EventType::QueueCleared);
        assert_eq!(bus.subscriber_count(EventType::QueueCleared), 1);
        bus.unsubscribe(EventType::QueueCleared, rx);
        assert_eq!(bus.subscriber_count(EventType::QueueCleared), 0);
        let msg = Arc::new(NotificationMessage::new(
            GuildId::new(1),
            EventType::QueueCleared,
            serde_json::Value::Null,
        ));
        assert_eq!(bus.publish(msg), 0);
    }

    #[tokio::test]
    async fn slow_bus_subscriber_receives_every_message_in_order() {
        let hub = NotificationHub::new(None);
        let mut slow = hub.bus().subscribe(EventType::TrackQueued);
        let gone = hub.bus().subscribe(EventType::TrackQueued);
        drop(gone);

        for i in 0..300 {
            assert_eq!(hub.notify(GuildId::new(1), EventType::TrackQueued, &i).bus, 1);
        }
        assert_eq!(hub.bus().subscriber_count(EventType::TrackQueued), 1);

        for i in 0..300 {
            let msg = slow.recv().await.unwrap();
            assert_eq!(msg.payload, serde_json::json!(i));
        }
        assert!(slow.try_recv().is_err());
    }

    #[test]
    fn unsubscribed_local_handler_is_not_called() {
        let hub = NotificationHub::new(None);
        let hits = Arc::new(AtomicUsize::new(0));
        let id = hub.subscribe_local(counting_subscriber(hits.clone()));
        assert!(hub.unsubscribe_local(id));
        hub.notify(GuildId::new(1), EventType::ShuffleToggled, &true);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
