use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::clock::{Clock, Timestamp};
use crate::codec::{self, Decoded, DropReason};
use crate::config::{AppConfig, Variant};
use crate::connection::{ConnectionController, ConnectionState};
use crate::demo::DemoSimulator;
use crate::history::HistoryPoint;
use crate::messages::{Command, TransportEvent};
use crate::mqtt::Transport;
use crate::replication::ReplicationRule;
use crate::router::{TopicRouter, sanitise_id};
use crate::staleness::StalenessMonitor;
use crate::store::{EntityState, Fragment, SlotStatus, StateStore};

/// Owns the whole view and is the only place it is mutated. Every transport
/// event, command and timer is handled here, one at a time, in arrival order.
pub struct Manager<T: Transport> {
    variant: Variant,
    default_id: String,
    current_id: String,
    tracked: Vec<String>,
    store: StateStore,
    replication: ReplicationRule,
    staleness: StalenessMonitor,
    connection: ConnectionController,
    router: Option<TopicRouter>,
    transport: Option<T>,
    demo: Option<DemoSimulator>,
    retain_timeout: Duration,
    retain_deadline: Option<Instant>,
    sweep_interval: Duration,
    clock: Box<dyn Clock>,
}

impl<T: Transport> Manager<T> {
    fn new(config: &AppConfig, connection: ConnectionController, clock: Box<dyn Clock>) -> Self {
        let variant = config.tracking.variant();
        let tracked = config.tracking.tracked_ids();
        let mut store = StateStore::new(config.timing.history_capacity());
        if variant == Variant::Multi {
            store.seed(tracked.iter().map(String::as_str), SlotStatus::Free);
        }

        Manager {
            variant,
            default_id: config.tracking.default_id(),
            current_id: config.tracking.default_id(),
            replication: ReplicationRule::new(
                config.replication.source(&config.tracking),
                config.replication.targets(&config.tracking),
            ),
            tracked,
            store,
            staleness: StalenessMonitor::new(config.timing.staleness()),
            connection,
            router: None,
            transport: None,
            demo: None,
            retain_timeout: config.timing.retain_warning(),
            retain_deadline: None,
            sweep_interval: config.timing.sweep_interval(),
            clock,
        }
    }

    /// Follows the feed behind `transport`. Subscriptions are issued once the
    /// transport reports `Connected`.
    pub fn live(config: &AppConfig, transport: T, clock: Box<dyn Clock>) -> Self {
        let mut manager = Self::new(config, ConnectionController::connecting(), clock);
        let namespace = config
            .mqtt
            .as_ref()
            .map(|mqtt| mqtt.topic_path())
            .unwrap_or_else(|| "parking".to_string());
        manager.router = Some(TopicRouter::new(
            &namespace,
            manager.variant,
            &manager.default_id,
            manager.tracked.clone(),
        ));
        manager.transport = Some(transport);
        manager
    }

    /// Runs on synthetic data. No transport exists, so nothing can connect.
    pub fn demo(config: &AppConfig, clock: Box<dyn Clock>) -> Self {
        let mut manager = Self::new(config, ConnectionController::demo(), clock);
        manager.demo = Some(DemoSimulator::new(
            manager.variant,
            config.demo.seed.unwrap_or(0),
        ));
        manager
    }

    pub fn snapshot(&self, id: &str) -> EntityState {
        self.store.read(id)
    }

    pub fn history(&self, id: &str) -> Vec<HistoryPoint> {
        self.store.history(id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn error_cause(&self) -> Option<&str> {
        self.connection.cause()
    }

    pub fn retain_warning(&self) -> bool {
        self.router.as_ref().is_some_and(TopicRouter::retain_warning)
    }

    pub fn subscription_error(&self) -> Option<&str> {
        self.router
            .as_ref()
            .and_then(TopicRouter::subscription_error)
    }

    pub fn current_id(&self) -> &str {
        &self.current_id
    }

    /// Every bay the view has an entry for.
    pub fn ids(&self) -> Vec<String> {
        self.store.ids().map(str::to_string).collect()
    }

    /// Processes events, commands and timers until `Command::Shutdown` (or the
    /// command channel closing), then tears everything down.
    pub async fn run(
        &mut self,
        mut events: Option<mpsc::Receiver<TransportEvent>>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let mut sweep = time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let demo_period = self
            .demo
            .as_ref()
            .map(DemoSimulator::tick_interval)
            .unwrap_or(self.sweep_interval);
        let mut demo_tick = time::interval(demo_period);

        loop {
            let live = self.transport.is_some();
            let demo = self.demo.is_some();

            tokio::select! {
                event = next_event(&mut events), if events.is_some() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("Transport event stream closed");
                        events = None;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::SwitchEntity(id)) => {
                        if self.switch_entity(&id) && demo {
                            demo_tick.reset_immediately();
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        // The pump keeps draining teardown without a receiver.
                        drop(events.take());
                        self.shutdown().await;
                        break;
                    }
                },
                _ = sweep.tick(), if live => self.sweep_stale(),
                _ = retain_timer(self.retain_deadline) => self.retain_timeout_elapsed(),
                _ = demo_tick.tick(), if demo => self.demo_tick(),
            }
        }
        info!("Exiting manager event loop");
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.connection.on_connected();
                // Clean sessions drop subscriptions, renew them on every connect.
                self.resubscribe();
            }
            TransportEvent::Dropped(cause) => {
                self.connection.on_dropped(&cause);
            }
            TransportEvent::Fatal(cause) => {
                self.connection.on_fatal(cause);
            }
            TransportEvent::SubscribeFailed(cause) => {
                if let Some(router) = self.router.as_mut() {
                    router.record_subscription_error(cause);
                }
            }
            TransportEvent::Message { topic, payload } => self.handle_message(&topic, &payload),
        }
    }

    fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        let Some(router) = self.router.as_mut() else {
            return;
        };
        let Some((id, kind)) = router.route(topic) else {
            return;
        };

        match codec::decode(kind, payload) {
            Decoded::Fragment(fragment) => {
                router.message_received();
                self.retain_deadline = None;
                self.apply(&id, &fragment);
            }
            Decoded::Drop(DropReason::UnknownStatus(value)) => {
                debug!("Ignoring status {:?} on {}", value, topic);
            }
            Decoded::Drop(DropReason::Malformed(reason)) => {
                warn!("Dropping malformed payload on {}: {}", topic, reason);
            }
            Decoded::Drop(DropReason::NoUsableFields) => {
                debug!("No usable fields in payload on {}", topic);
            }
        }
    }

    fn resubscribe(&mut self) {
        let (Some(router), Some(transport)) = (self.router.as_mut(), self.transport.as_mut())
        else {
            return;
        };
        router.subscribe(transport);
        self.retain_deadline = Some(Instant::now() + self.retain_timeout);
    }

    /// Merges through the replication rule, so a source update lands on all
    /// targets with one timestamp.
    fn apply(&mut self, id: &str, fragment: &Fragment) {
        let now: Timestamp = self.clock.now();
        for written in self.replication.apply(&mut self.store, id, fragment, now) {
            self.log_view(&written);
        }
    }

    fn log_view(&self, id: &str) {
        let state = self.store.read(id);
        match serde_json::to_string(&state) {
            Ok(json) => info!("{}", json),
            Err(err) => warn!("Could not render state of {}: {}", id, err),
        }
    }

    /// Follows another bay in the single-entity view. The new bay starts from
    /// an empty view and the retain timer is restarted.
    pub fn switch_entity(&mut self, raw_id: &str) -> bool {
        if self.variant == Variant::Multi {
            warn!("Ignoring switch to {:?}: every tracked bay is followed", raw_id);
            return false;
        }

        let next = match (self.router.as_mut(), self.transport.as_mut()) {
            (Some(router), Some(transport)) => {
                let connected = self.connection.state() == ConnectionState::Connected;
                match router.switch_to(transport, raw_id, connected) {
                    Some(next) => {
                        self.retain_deadline =
                            connected.then(|| Instant::now() + self.retain_timeout);
                        next
                    }
                    None => return false,
                }
            }
            _ => {
                let next = sanitise_id(raw_id, &self.default_id);
                if next == self.current_id {
                    return false;
                }
                if let Some(demo) = self.demo.as_mut() {
                    demo.restart();
                }
                next
            }
        };

        self.store.reset(&next);
        self.current_id = next;
        true
    }

    pub fn sweep_stale(&mut self) {
        if self.demo.is_some() {
            return;
        }
        let now = self.clock.now();
        for id in self.staleness.sweep(&mut self.store, now) {
            info!("Distance for {} is stale, clearing it", id);
        }
    }

    fn retain_timeout_elapsed(&mut self) {
        self.retain_deadline = None;
        if let Some(router) = self.router.as_mut() {
            router.raise_retain_warning();
        }
    }

    pub fn demo_tick(&mut self) {
        let Some(demo) = self.demo.as_mut() else {
            return;
        };
        let fragment = demo.next_fragment();

        let targets = match (self.variant, self.replication.source()) {
            (Variant::Single, _) => vec![self.current_id.clone()],
            (Variant::Multi, Some(source)) => vec![source.to_string()],
            (Variant::Multi, None) => self.tracked.clone(),
        };
        for id in targets {
            self.apply(&id, &fragment);
        }
    }

    /// Cancels every timer, unsubscribes and disconnects, then releases the
    /// transport. Nothing is delivered after this returns; the last view and
    /// flags stay readable.
    pub async fn shutdown(&mut self) {
        self.retain_deadline = None;
        self.demo = None;
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        let topics = self
            .router
            .as_mut()
            .map(TopicRouter::take_subscriptions)
            .unwrap_or_default();
        if let Err(err) = transport.close(&topics).await {
            warn!("Failed to disconnect cleanly: {}", err);
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn retain_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
