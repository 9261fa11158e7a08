use crate::config::Config;
use crate::forwarder::{Fanout, Forwarder};
use crate::store::MessageStore;
use protocol::{Body, Message, Status};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The broker process: the forwarder proxy plus the bookkeeping, pacing,
/// liveness, and logging tasks around it.
pub struct Broker {
    config: Config,
    forwarder: Forwarder,
}

impl Broker {
    /// Bind both forwarder ports. Models may begin connecting immediately.
    pub async fn bind(config: Config) -> anyhow::Result<Self> {
        let forwarder = Forwarder::bind(&config.ingress, &config.egress).await?;
        Ok(Self { config, forwarder })
    }

    pub fn ingress_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.forwarder.ingress_addr()
    }

    pub fn egress_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.forwarder.egress_addr()
    }

    /// Drive the federation until the last increment completes and the log
    /// drains, a liveness window expires, or `cancel` fires. Fatal paths
    /// return Err; the binary maps them onto a non-zero exit.
    pub async fn run<S: MessageStore>(
        self,
        store: S,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let Self { config, forwarder } = self;
        tracing::info!(models = ?config.models, max_incstep = config.max_incstep, "broker is booting");

        let fanout = forwarder.handle();
        let shared = Arc::new(Shared::new(config));
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = mpsc::unbounded_channel();

        let tasks = [
            supervise("forwarder", &cancel, forwarder.run(cancel.clone())),
            supervise(
                "subscriber",
                &cancel,
                subscribe(shared.clone(), fanout.clone(), log_tx, cancel.clone()),
            ),
            supervise(
                "publisher",
                &cancel,
                publish(fanout, publish_rx, cancel.clone()),
            ),
            supervise(
                "heartbeat",
                &cancel,
                heartbeat(shared.clone(), publish_tx.clone(), cancel.clone()),
            ),
            supervise(
                "pacemaker",
                &cancel,
                pace(shared.clone(), publish_tx, cancel.clone()),
            ),
            supervise("watchdog", &cancel, watch(shared.clone(), cancel.clone())),
            supervise(
                "log-writer",
                &cancel,
                write_log(shared, store, log_rx, cancel.clone()),
            ),
        ];

        let mut first_error = None;
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error.get_or_insert(anyhow::Error::from(join_err));
                }
            }
        }
        tracing::info!("broker has shut down");
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Bookkeeping shared by the broker's tasks.
struct Shared {
    config: Config,
    status: Mutex<Status>,
    incstep: AtomicU32,
    /// Last status seen per declared model: (status, its incstep).
    latest_status: Mutex<BTreeMap<String, (Status, u32)>>,
    /// Models heard from in the current watchdog window.
    tracker: Mutex<BTreeSet<String>>,
    /// Data messages accepted but not yet written by the log writer.
    log_pending: AtomicUsize,
}

impl Shared {
    fn new(config: Config) -> Self {
        Self {
            config,
            status: Mutex::new(Status::Booting),
            incstep: AtomicU32::new(1),
            latest_status: Mutex::new(BTreeMap::new()),
            tracker: Mutex::new(BTreeSet::new()),
            log_pending: AtomicUsize::new(0),
        }
    }

    fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: Status) {
        *self.status.lock().unwrap() = status;
    }

    fn incstep(&self) -> u32 {
        self.incstep.load(Ordering::Acquire)
    }

    fn advance_incstep(&self) {
        self.incstep.fetch_add(1, Ordering::AcqRel);
    }

    fn record_status(&self, source: &str, status: Status, incstep: u32) {
        self.latest_status
            .lock()
            .unwrap()
            .insert(source.to_string(), (status, incstep));
        self.tracker.lock().unwrap().insert(source.to_string());
    }

    fn tracker_filled(&self) -> bool {
        *self.tracker.lock().unwrap() == self.config.models
    }

    fn clear_tracker(&self) {
        self.tracker.lock().unwrap().clear();
    }

    fn missing_models(&self) -> BTreeSet<String> {
        let tracker = self.tracker.lock().unwrap();
        self.config.models.difference(&tracker).cloned().collect()
    }

    /// True when every declared model reports ready at the current incstep.
    fn all_ready(&self) -> bool {
        let latest = self.latest_status.lock().unwrap();
        let incstep = self.incstep();
        self.config
            .models
            .iter()
            .all(|model| latest.get(model) == Some(&(Status::Ready, incstep)))
    }
}

// Runs a task to completion; any return, clean or failed, shuts down the pool.
fn supervise(
    name: &'static str,
    cancel: &CancellationToken,
    task: impl Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let result = task.await;
        if let Err(err) = &result {
            tracing::error!(task = name, error = format!("{err:#}"), "task failed; shutting down");
        }
        cancel.cancel();
        result
    })
}

/// Consume the forwarded stream for bookkeeping: declared models' statuses
/// update the tracker, data messages go to the log writer.
async fn subscribe(
    shared: Arc<Shared>,
    fanout: Fanout,
    log_queue: mpsc::UnboundedSender<(String, Message)>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut stream = fanout.subscribe();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = stream.recv() => match next {
                Ok(line) => {
                    let message = match Message::decode(&line) {
                        Ok(message) => message,
                        Err(err) => {
                            tracing::warn!(error = %err, "skipping undecodable line");
                            continue;
                        }
                    };
                    if let Body::Status { status, .. } = &message.body {
                        if shared.config.models.contains(&message.source) {
                            shared.record_status(&message.source, *status, message.incstep);
                        }
                    }
                    if matches!(message.body, Body::Data { .. }) {
                        shared.log_pending.fetch_add(1, Ordering::AcqRel);
                        let _ = log_queue.send(("sub".to_string(), message));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "bookkeeping subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// Drain the outbound queue onto the wire, so every subscriber sees the
/// broker's heartbeats and pulses.
async fn publish(
    fanout: Fanout,
    mut queue: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = queue.recv() => match next {
                Some(message) => {
                    tracing::debug!(signal = message.signal(), incstep = message.incstep, "publishing");
                    fanout.publish(&message)?;
                }
                None => return Ok(()),
            },
        }
    }
}

/// Announce broker status once per tick.
async fn heartbeat(
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(shared.config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            _ = interval.tick() => {
                let message = Message::broker_status(
                    shared.status(),
                    shared.incstep(),
                    shared.config.initial_year,
                );
                if queue.send(message).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Emit the next increment pulse once every declared model is ready at the
/// current step. Past the last step, wait for the log to drain and finish.
async fn pace(
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(shared.config.pace_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            _ = interval.tick() => {
                if !shared.all_ready() {
                    continue;
                }
                let incstep = shared.incstep();
                if incstep > shared.config.max_incstep {
                    if shared.log_pending.load(Ordering::Acquire) == 0 {
                        tracing::info!(
                            max_incstep = shared.config.max_incstep,
                            "successfully finished last increment"
                        );
                        cancel.cancel();
                        return Ok(());
                    }
                    // Results are still queued for the log; check again next tick.
                } else {
                    tracing::info!(incstep, "sending increment pulse");
                    let message = Message::increment(
                        shared.status(),
                        incstep,
                        shared.config.initial_year,
                    );
                    if queue.send(message).is_err() {
                        return Ok(());
                    }
                    shared.advance_incstep();
                }
            }
        }
    }
}

/// Prove liveness window by window: during boot, every declared model must
/// report within `boot_timer`; thereafter the tracker must refill within
/// each `watchdog_timer` window. An expired window is fatal.
async fn watch(shared: Arc<Shared>, cancel: CancellationToken) -> anyhow::Result<()> {
    loop {
        let booting = shared.status() == Status::Booting;
        let window = if booting {
            shared.config.boot_timer
        } else {
            shared.config.watchdog_timer
        };
        let poll = (window / 20).max(Duration::from_millis(10));
        let deadline = tokio::time::Instant::now() + window;

        let mut filled = false;
        while tokio::time::Instant::now() < deadline {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(poll) => {}
            }
            if shared.tracker_filled() {
                if booting {
                    tracing::info!("every model reported; broker is booted");
                }
                shared.set_status(Status::Booted);
                shared.clear_tracker();
                filled = true;
                break;
            }
        }
        if !filled {
            anyhow::bail!(
                "Timed out waiting for {:?}{}",
                shared.missing_models(),
                if booting { " to initialize" } else { "" }
            );
        }
    }
}

/// Pop (collection, message) pairs and insert them into the append-only
/// store. Shutdown drains the queue before closing.
async fn write_log<S: MessageStore>(
    shared: Arc<Shared>,
    mut store: S,
    mut queue: mpsc::UnboundedReceiver<(String, Message)>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                while let Ok((collection, message)) = queue.try_recv() {
                    store.append(&collection, &message)?;
                    shared.log_pending.fetch_sub(1, Ordering::AcqRel);
                }
                return Ok(());
            }
            next = queue.recv() => match next {
                Some((collection, message)) => {
                    store.append(&collection, &message)?;
                    shared.log_pending.fetch_sub(1, Ordering::AcqRel);
                }
                None => return Ok(()),
            },
        }
    }
}
