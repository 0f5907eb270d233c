use std::collections::HashSet;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::model::{GpsLocation, normalise_address};

/// Live GPS fixes. Dropping the stream ends the subscription.
pub type LocationStream = Pin<Box<dyn Stream<Item = GpsLocation> + Send>>;

/// Platform location provider.
pub trait LocationSource: Send + Sync + Debug {
    /// Opens a subscription to location updates.
    fn updates(&self) -> LocationStream;
}

/// Emits one configured position, re-stamped on every tick.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocationSource {
    latitude: f64,
    longitude: f64,
    altitude: f64,
    every: Duration,
}

impl FixedLocationSource {
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, altitude: f64, every: Duration) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
            every,
        }
    }
}

impl LocationSource for FixedLocationSource {
    fn updates(&self) -> LocationStream {
        let mut ticks = interval(self.every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let source = *self;
        Box::pin(IntervalStream::new(ticks).map(move |_| {
            GpsLocation::new(
                source.latitude,
                source.longitude,
                source.altitude,
                OffsetDateTime::now_utc(),
            )
        }))
    }
}

/// Location source fed by [`ChannelLocationSource::publish`].
#[derive(Debug, Clone)]
pub struct ChannelLocationSource {
    sender: broadcast::Sender<GpsLocation>,
}

impl Default for ChannelLocationSource {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }
}

impl ChannelLocationSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a fix to every open subscription. Returns the receiver count.
    pub fn publish(&self, location: GpsLocation) -> usize {
        self.sender.send(location).unwrap_or_default()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl LocationSource for ChannelLocationSource {
    fn updates(&self) -> LocationStream {
        Box::pin(
            BroadcastStream::new(self.sender.subscribe()).filter_map(|update| update.ok()),
        )
    }
}

#[derive(Debug)]
struct Subscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Shares one location subscription between every syncing camera.
///
/// The subscription runs while at least one device is registered. The latest
/// fix survives a stop so a reconnecting camera can be brought up to date.
#[derive(Debug)]
pub struct LocationCollector {
    source: Arc<dyn LocationSource>,
    registered: Mutex<HashSet<String>>,
    subscription: Mutex<Option<Subscription>>,
    latest: watch::Sender<Option<GpsLocation>>,
    collecting: watch::Sender<bool>,
}

impl LocationCollector {
    #[must_use]
    pub fn new(source: Arc<dyn LocationSource>) -> Self {
        Self {
            source,
            registered: Mutex::new(HashSet::new()),
            subscription: Mutex::new(None),
            latest: watch::Sender::new(None),
            collecting: watch::Sender::new(false),
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a consumer, starting the subscription for the first one.
    ///
    /// Registering the same device twice counts once.
    pub fn register_device(&self, device: &str) {
        let mut registered = Self::lock(&self.registered);
        if registered.insert(normalise_address(device)) {
            debug!(device, consumers = registered.len(), "location consumer registered");
        }
        if registered.len() == 1 {
            self.start();
        }
    }

    /// Removes a consumer, stopping the subscription after the last one.
    pub fn unregister_device(&self, device: &str) {
        let mut registered = Self::lock(&self.registered);
        if registered.remove(&normalise_address(device)) {
            debug!(device, consumers = registered.len(), "location consumer unregistered");
        }
        if registered.is_empty() {
            self.stop();
        }
    }

    #[must_use]
    pub fn registered_count(&self) -> usize {
        Self::lock(&self.registered).len()
    }

    /// Latest fix; `None` until the first update arrives.
    #[must_use]
    pub fn location_updates(&self) -> watch::Receiver<Option<GpsLocation>> {
        self.latest.subscribe()
    }

    #[must_use]
    pub fn latest(&self) -> Option<GpsLocation> {
        *self.latest.borrow()
    }

    /// Mirrors whether the subscription is running.
    #[must_use]
    pub fn is_collecting(&self) -> watch::Receiver<bool> {
        self.collecting.subscribe()
    }

    fn start(&self) {
        let mut subscription = Self::lock(&self.subscription);
        if subscription.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let mut updates = self.source.updates();
        let latest = self.latest.clone();
        let stop = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let update = tokio::select! {
                    biased;
                    () = stop.cancelled() => break,
                    update = updates.next() => update,
                };
                let Some(location) = update else {
                    debug!("location source ended");
                    break;
                };
                trace!(
                    latitude = location.latitude,
                    longitude = location.longitude,
                    "location update"
                );
                latest.send_replace(Some(location));
            }
        });

        *subscription = Some(Subscription { cancel, task });
        self.collecting.send_replace(true);
        info!("location collection started");
    }

    fn stop(&self) {
        let Some(subscription) = Self::lock(&self.subscription).take() else {
            return;
        };
        subscription.cancel.cancel();
        subscription.task.abort();
        self.collecting.send_replace(false);
        info!("location collection stopped");
    }
}

impl Drop for LocationCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use time::macros::datetime;
    use tokio::task::yield_now;

    use super::*;

    fn fix(latitude: f64) -> GpsLocation {
        GpsLocation::new(latitude, 2.25, 35.0, datetime!(2025-03-15 12:00:00 UTC))
    }

    #[tokio::test]
    async fn subscription_follows_the_consumer_count() {
        let source = ChannelLocationSource::new();
        let collector = LocationCollector::new(Arc::new(source.clone()));
        let collecting = collector.is_collecting();

        collector.register_device("aa:00:00:00:00:01");
        collector.register_device("AA:00:00:00:00:01");
        collector.register_device("AA:00:00:00:00:02");
        assert_eq!(true, *collecting.borrow());
        assert_eq!(2, collector.registered_count());
        assert_eq!(1, source.subscriber_count());

        collector.unregister_device("AA:00:00:00:00:01");
        assert_eq!(true, *collecting.borrow());

        collector.unregister_device("AA:00:00:00:00:02");
        assert_eq!(false, *collecting.borrow());
    }

    #[tokio::test]
    async fn latest_fix_is_absent_until_the_first_update() {
        let source = ChannelLocationSource::new();
        let collector = LocationCollector::new(Arc::new(source.clone()));
        let mut updates = collector.location_updates();
        assert_eq!(None, collector.latest());

        collector.register_device("AA:00:00:00:00:01");
        yield_now().await;
        source.publish(fix(48.5));
        updates
            .changed()
            .await
            .expect("collector should publish the fix");

        assert_eq!(Some(fix(48.5)), *updates.borrow());
    }

    #[tokio::test]
    async fn unregistering_an_unknown_device_is_a_no_op() {
        let collector = LocationCollector::new(Arc::new(ChannelLocationSource::new()));

        collector.unregister_device("AA:00:00:00:00:09");

        assert_eq!(false, *collector.is_collecting().borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_source_ticks_at_its_interval() {
        let source = FixedLocationSource::new(1.5, 2.5, 0.0, Duration::from_secs(30));
        let mut updates = source.updates();

        let first = updates.next().await.expect("first tick should be immediate");
        let start = tokio::time::Instant::now();
        let second = updates.next().await.expect("second tick should follow");

        assert_eq!((1.5, 2.5), (first.latitude, first.longitude));
        assert_eq!((1.5, 2.5), (second.latitude, second.longitude));
        assert_eq!(Duration::from_secs(30), start.elapsed());
    }
}
