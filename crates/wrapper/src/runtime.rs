use crate::config::{load_json_documents, Config};
use crate::increment::handle_increment;
use crate::model::Model;
use crate::state::State;
use anyhow::Context;
use mesh::{Graph, Translator};
use protocol::{Body, Message, Status};
use registry::SchemaSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The runtime hosting one model: boot, task pool, shutdown.
pub struct Runtime {
    config: Config,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Boot the model and drive it until completion or a fatal condition.
    /// Returns Err on any fatal path; the caller maps that onto a non-zero
    /// exit status.
    pub async fn run<M: Model>(self, mut model: M) -> anyhow::Result<()> {
        let model_id = model.id().to_string();

        let input_schemas = SchemaSet::from_dir(&self.config.input_schema_dir)?;
        let output_schemas = SchemaSet::from_dir(&self.config.output_schema_dir)?;
        let initial_conditions = load_json_documents(&self.config.config_dir)?;

        let abstracts = Graph::from_path(&self.config.abstract_graph)?;
        let mut instances = Graph::from_path(&self.config.instance_graph)?;
        for (id, area) in &self.config.area_overrides {
            instances.set_area(id, *area);
        }
        let translator = Translator::new(Arc::new(abstracts), Arc::new(instances));

        tracing::info!(
            model = %model_id,
            inputs = input_schemas.len(),
            outputs = output_schemas.len(),
            "booting model"
        );
        model
            .configure(initial_conditions)
            .context("model configure failed")?;

        let state = Arc::new(State::new(
            model_id,
            input_schemas,
            output_schemas,
            translator,
        ));

        let cancel = CancellationToken::new();
        let subscriber =
            transport::Subscriber::connect(&self.config.broker_egress, &cancel).await?;
        let publisher =
            transport::Publisher::connect(&self.config.broker_ingress, &cancel).await?;

        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let (broker_tx, broker_rx) = mpsc::unbounded_channel();
        let (action_tx, action_rx) = mpsc::unbounded_channel();

        let tasks = [
            supervise(
                "subscriber",
                &cancel,
                subscribe(
                    state.clone(),
                    subscriber,
                    broker_tx,
                    action_tx,
                    cancel.clone(),
                ),
            ),
            supervise(
                "publisher",
                &cancel,
                publish(state.clone(), publisher, publish_rx, cancel.clone()),
            ),
            supervise(
                "status-ticker",
                &cancel,
                tick_status(
                    state.clone(),
                    publish_tx.clone(),
                    self.config.status_interval,
                    cancel.clone(),
                ),
            ),
            supervise(
                "action-worker",
                &cancel,
                work_actions(
                    state.clone(),
                    model,
                    action_rx,
                    publish_tx.clone(),
                    cancel.clone(),
                ),
            ),
            supervise(
                "watchdog",
                &cancel,
                watch_broker(
                    state.clone(),
                    broker_rx,
                    self.config.broker_timeout,
                    cancel.clone(),
                ),
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
        tracing::info!(model = %state.model_id, "model has shut down");
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

// Runs a task to completion. Any return, clean or failed, cancels the whole
// pool: each task runs for the lifetime of the process.
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

/// Consume the broker's egress stream: broker statuses go to the watchdog,
/// data messages through the input pipeline, everything else to the action
/// queue.
async fn subscribe(
    state: Arc<State>,
    mut subscriber: transport::Subscriber,
    broker_queue: mpsc::UnboundedSender<Message>,
    action_queue: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = subscriber.recv() => match next? {
                Some(message) => {
                    tracing::debug!(source = %message.source, signal = message.signal(), "received message");
                    match &message.body {
                        Body::Status { .. } if message.is_from_broker() => {
                            let _ = broker_queue.send(message);
                        }
                        Body::Data { payload, .. } => state.insert_data_message(payload)?,
                        _ => {
                            let _ = action_queue.send(message);
                        }
                    }
                }
                None => anyhow::bail!("broker egress stream closed"),
            },
        }
    }
}

/// Drain the outbound queue into the broker's ingress, re-checking data
/// messages against the output schema set on the way out.
async fn publish(
    state: Arc<State>,
    mut publisher: transport::Publisher,
    mut queue: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                publisher.close().await;
                return Ok(());
            }
            next = queue.recv() => match next {
                Some(message) => {
                    if let Body::Data { payload, .. } = &message.body {
                        let value = serde_json::to_value(payload)?;
                        let matched = state.output_schemas.matches(&value);
                        match matched.len() {
                            0 => {
                                tracing::info!("message didn't match any output schemas; dropping");
                                continue;
                            }
                            1 => tracing::info!(
                                schema = matched[0].name(),
                                "validated outgoing message"
                            ),
                            n => anyhow::bail!("outgoing message matched {n} output schemas"),
                        }
                    }
                    publisher.send(&message).await?;
                }
                None => {
                    publisher.close().await;
                    return Ok(());
                }
            },
        }
    }
}

/// Publish the model's status once per tick.
async fn tick_status(
    state: Arc<State>,
    queue: mpsc::UnboundedSender<Message>,
    period: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut ticks = 0u64;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            _ = interval.tick() => {
                ticks += 1;
                let incstep = state.incstep();
                let message = Message::status(
                    state.model_id.as_str(),
                    incstep,
                    state.year(incstep),
                    state.current_status(),
                    ticks,
                );
                if queue.send(message).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Pop control messages and perform their action. Currently the only action
/// is the increment pulse.
async fn work_actions<M: Model>(
    state: Arc<State>,
    mut model: M,
    mut actions: mpsc::UnboundedReceiver<Message>,
    publish_queue: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = actions.recv() => match next {
                Some(message) => match &message.body {
                    Body::Increment { .. } => {
                        let incstep = message.incstep;
                        // The model's increment is synchronous and may be
                        // compute-heavy; keep the worker threads breathing.
                        tokio::task::block_in_place(|| {
                            handle_increment(&state, &mut model, incstep, &publish_queue)
                        })?;
                    }
                    _ => tracing::debug!(
                        signal = message.signal(),
                        source = %message.source,
                        "no action for signal"
                    ),
                },
                None => return Ok(()),
            },
        }
    }
}

/// Await broker heartbeats. A `booted` broker status connects the model and
/// records the federation's initial year; a silent window is fatal.
async fn watch_broker(
    state: Arc<State>,
    mut broker_queue: mpsc::UnboundedReceiver<Message>,
    timeout: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = tokio::time::timeout(timeout, broker_queue.recv()) => match next {
                Ok(Some(message)) => {
                    if let Body::Status { status: Status::Booted, initial_year, .. } = message.body {
                        state.mark_connected(initial_year);
                    }
                }
                Ok(None) => return Ok(()),
                Err(_) => anyhow::bail!("timed out waiting for broker message"),
            },
        }
    }
}
