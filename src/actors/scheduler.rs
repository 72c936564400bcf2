//! SchedulerActor - Owns the task queue and dispatches due tasks
//!
//! ## Message Flow
//!
//! ```text
//! Update ──► merge desired items ──► TaskQueue
//!                                      │ tick (1s)
//!                                      ▼
//!                          pop due ─► capacity check ─► spawn plugin call
//!                                      ▲                      │
//!                                      └──── TaskDone ◄───────┘
//! ```
//!
//! Plugin calls run on their own tokio tasks. Their completion comes back
//! through a bounded channel, so only this actor ever touches the queue.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, instrument, trace, warn};

use super::messages::{SchedulerCommand, SchedulerStats, UpdateSummary};
use crate::access::AccessGate;
use crate::expression::Expressions;
use crate::interval::{Delay, MAX_DELAY_SECS};
use crate::key::ItemKey;
use crate::plugin::{ExportContext, Plugin, PluginError, Registry};
use crate::task::{ExportItem, ItemRequest, ResultWriter, SingleResult, TaskId, TaskKind, TaskQueue};
use crate::{CheckResult, UNSUPPORTED_KEY};

/// Client id used for single-shot checks
pub const SINGLE_SHOT_CLIENT: u64 = 0;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound for one plugin call
    pub timeout: Duration,
    /// Dispatch period
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            tick: Duration::from_secs(1),
        }
    }
}

struct ClientState {
    expressions: Arc<Expressions>,
    items: HashMap<u64, TaskId>,
}

#[derive(Debug, Default)]
struct PluginState {
    /// Capacity units held by running tasks
    load: u32,
    /// Live exporter tasks, across all clients
    exporters: usize,
    collector: Option<TaskId>,
}

/// Completion report of one dispatched task
#[derive(Debug)]
struct TaskDone {
    id: TaskId,
    plugin: String,
    weight: u32,
    failed: bool,
}

pub struct SchedulerActor {
    registry: Arc<Registry>,
    gate: Arc<AccessGate>,
    queue: TaskQueue,
    clients: HashMap<u64, ClientState>,
    plugins: HashMap<String, PluginState>,
    command_rx: mpsc::Receiver<SchedulerCommand>,
    done_tx: mpsc::Sender<TaskDone>,
    done_rx: mpsc::Receiver<TaskDone>,
    config: SchedulerConfig,
    completed: u64,
}

impl SchedulerActor {
    pub fn new(
        registry: Arc<Registry>,
        gate: Arc<AccessGate>,
        config: SchedulerConfig,
        command_rx: mpsc::Receiver<SchedulerCommand>,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::channel(256);
        Self {
            registry,
            gate,
            queue: TaskQueue::new(),
            clients: HashMap::new(),
            plugins: HashMap::new(),
            command_rx,
            done_tx,
            done_rx,
            config,
            completed: 0,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting scheduler actor");

        self.sync_collectors(Utc::now());

        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.dispatch(Utc::now());
                }

                Some(done) = self.done_rx.recv() => {
                    self.complete(done, Utc::now());
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SchedulerCommand::Update { client_id, writer, requests, expressions, respond_to }) => {
                            let summary = self.update(client_id, writer, requests, expressions, Utc::now());
                            let _ = respond_to.send(summary);
                        }

                        Some(SchedulerCommand::CheckOnce { key, writer }) => {
                            let now = Utc::now();
                            self.check_once(&key, writer, now).await;
                            self.dispatch(now);
                        }

                        Some(SchedulerCommand::GetStats { respond_to }) => {
                            let _ = respond_to.send(self.stats());
                        }

                        Some(SchedulerCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }

                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        debug!("scheduler actor stopped");
    }

    fn plugin_state(&mut self, plugin: &Plugin) -> &mut PluginState {
        self.plugins.entry(plugin.name.clone()).or_default()
    }

    fn insert_exporter(&mut self, plugin: Arc<Plugin>, scheduled: DateTime<Utc>, item: ExportItem) -> TaskId {
        self.plugin_state(&plugin).exporters += 1;
        self.queue.insert(plugin, scheduled, TaskKind::Exporter(item))
    }

    fn remove_task(&mut self, id: TaskId) {
        let Some(task) = self.queue.remove(id) else {
            return;
        };
        if let TaskKind::Exporter(_) = task.kind {
            let state = self.plugin_state(&task.plugin);
            state.exporters = state.exporters.saturating_sub(1);
        }
        trace!("removed {} task {}", task.kind.label(), id);
    }

    /// Merge the desired item list of one client into the queue
    fn update(
        &mut self,
        client_id: u64,
        writer: Arc<dyn ResultWriter>,
        requests: Vec<ItemRequest>,
        expressions: Arc<Expressions>,
        now: DateTime<Utc>,
    ) -> UpdateSummary {
        let mut summary = UpdateSummary::default();
        let mut client = match self.clients.remove(&client_id) {
            Some(mut client) => {
                client.expressions = expressions;
                client
            }
            None => ClientState {
                expressions,
                items: HashMap::new(),
            },
        };

        let mut wanted = HashSet::new();
        for request in requests {
            let key = match ItemKey::parse(&request.key) {
                Ok(key) => key,
                Err(e) => {
                    warn!("skipping item {}: invalid key \"{}\": {}", request.itemid, request.key, e);
                    summary.skipped += 1;
                    continue;
                }
            };

            let Some(plugin) = self
                .registry
                .lookup(&key.name)
                .filter(|p| p.capabilities.exporter().is_some())
            else {
                warn!("skipping item {}: unknown metric \"{}\"", request.itemid, key.name);
                summary.skipped += 1;
                continue;
            };

            let delay = match Delay::parse(&request.delay) {
                Ok(delay) => delay,
                Err(e) => {
                    warn!("skipping item {} ({}): {}", request.itemid, request.key, e);
                    summary.skipped += 1;
                    continue;
                }
            };

            wanted.insert(request.itemid);

            let item = ExportItem {
                itemid: request.itemid,
                client_id,
                key: request.key.clone(),
                name: key.name,
                params: key.params,
                delay,
                delay_text: request.delay.clone(),
                log: Some(crate::LogMeta {
                    lastlogsize: request.lastlogsize,
                    mtime: request.mtime,
                }),
                writer: writer.clone(),
            };

            if let Some(&id) = client.items.get(&request.itemid) {
                let same_key = matches!(
                    self.queue.get(id).map(|t| &t.kind),
                    Some(TaskKind::Exporter(current)) if current.key == request.key
                );

                if same_key {
                    let mut reschedule = false;
                    if let Some(task) = self.queue.get_mut(id) {
                        if let TaskKind::Exporter(current) = &mut task.kind {
                            reschedule = current.delay != item.delay;
                            *current = item;
                        }
                    }
                    let at = match self.queue.get(id).map(|t| &t.kind) {
                        Some(TaskKind::Exporter(current)) if reschedule => {
                            Some(next_check(current, now, false))
                        }
                        _ => None,
                    };
                    if let Some(at) = at {
                        self.queue.reschedule_idle(id, at);
                    }
                    summary.updated += 1;
                    continue;
                }

                // key changed: the old task goes, a new one starts now
                self.remove_task(id);
                let id = self.insert_exporter(plugin, now, item);
                client.items.insert(request.itemid, id);
                summary.updated += 1;
                continue;
            }

            let id = self.insert_exporter(plugin, now, item);
            client.items.insert(request.itemid, id);
            summary.added += 1;
        }

        let stale: Vec<(u64, TaskId)> = client
            .items
            .iter()
            .filter(|(itemid, _)| !wanted.contains(*itemid))
            .map(|(itemid, id)| (*itemid, *id))
            .collect();
        for (itemid, id) in stale {
            client.items.remove(&itemid);
            self.remove_task(id);
            summary.removed += 1;
        }

        if client.items.is_empty() {
            debug!("client {} has no items left", client_id);
        } else {
            self.clients.insert(client_id, client);
        }

        self.sync_collectors(now);

        debug!(
            "client {} updated: {} added, {} updated, {} removed, {} skipped",
            client_id, summary.added, summary.updated, summary.removed, summary.skipped
        );
        summary
    }

    /// Start collectors that are in use and stop the ones that are not
    fn sync_collectors(&mut self, now: DateTime<Utc>) {
        let registry = self.registry.clone();
        for plugin in registry.plugins() {
            if plugin.capabilities.collector().is_none() {
                continue;
            }
            let standalone = plugin.capabilities.exporter().is_none();
            let state = self.plugin_state(plugin);
            let wanted = standalone || state.exporters > 0;

            match (wanted, state.collector) {
                (true, None) => {
                    let id = self.queue.insert(plugin.clone(), now, TaskKind::Collector);
                    self.plugin_state(plugin).collector = Some(id);
                    debug!("activated collector of plugin {}", plugin.name);
                }
                (false, Some(id)) => {
                    self.plugin_state(plugin).collector = None;
                    self.remove_task(id);
                    debug!("deactivated collector of plugin {}", plugin.name);
                }
                _ => {}
            }
        }
    }

    /// Queue a single-shot evaluation, or answer right away when the key
    /// cannot run at all
    async fn check_once(&mut self, text: &str, writer: Arc<dyn ResultWriter>, now: DateTime<Utc>) {
        let key = match ItemKey::parse(text) {
            Ok(key) => key,
            Err(e) => {
                debug!("rejecting single-shot key \"{}\": {}", text, e);
                writer
                    .write(CheckResult::error(0, format!("Invalid item key format: {e}")))
                    .await;
                return;
            }
        };

        let plugin = self
            .registry
            .lookup(&key.name)
            .filter(|p| p.capabilities.exporter().is_some());
        let Some(plugin) = plugin.filter(|_| self.gate.check_rules(&key.name, &key.params)) else {
            writer.write(CheckResult::error(0, UNSUPPORTED_KEY)).await;
            return;
        };

        let item = ExportItem {
            itemid: 0,
            client_id: SINGLE_SHOT_CLIENT,
            key: text.to_string(),
            name: key.name,
            params: key.params,
            delay: Delay::every(0),
            delay_text: String::new(),
            log: None,
            writer,
        };
        self.queue.insert(plugin, now, TaskKind::PassiveCheck(item));
    }

    /// Dispatch every due task the plugin budgets allow
    fn dispatch(&mut self, now: DateTime<Utc>) {
        for id in self.queue.pop_due(now) {
            let Some(task) = self.queue.get(id) else {
                continue;
            };
            let plugin = task.plugin.clone();
            let weight = task.weight();
            let scheduled = task.scheduled;

            let state = self.plugin_state(&plugin);
            if weight > 0 && state.load + weight > plugin.capacity {
                trace!("plugin {} at capacity, task {} waits", plugin.name, id);
                self.queue.requeue(id, scheduled);
                continue;
            }
            state.load += weight;
            self.start(id);
        }
    }

    fn start(&mut self, id: TaskId) {
        let Some(task) = self.queue.get_mut(id) else {
            return;
        };
        task.running = true;

        let plugin = task.plugin.clone();
        let weight = task.weight();
        let done_tx = self.done_tx.clone();
        let call_timeout = self.config.timeout;

        match &task.kind {
            TaskKind::Collector => {
                let Some(collector) = plugin.capabilities.collector().cloned() else {
                    return;
                };
                tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(collector.collect()).catch_unwind().await;
                    let failed = match outcome {
                        Ok(Ok(())) => false,
                        Ok(Err(e)) => {
                            warn!("collector of plugin {} failed: {}", plugin.name, e);
                            true
                        }
                        Err(_) => {
                            error!("collector of plugin {} panicked", plugin.name);
                            true
                        }
                    };
                    let _ = done_tx
                        .send(TaskDone {
                            id,
                            plugin: plugin.name.clone(),
                            weight,
                            failed,
                        })
                        .await;
                });
            }

            TaskKind::Exporter(item) | TaskKind::PassiveCheck(item) => {
                let Some(exporter) = plugin.capabilities.exporter().cloned() else {
                    return;
                };
                let item = item.clone();
                let expressions = self
                    .clients
                    .get(&item.client_id)
                    .map(|c| c.expressions.clone())
                    .unwrap_or_default();
                let allowed = self.gate.check_rules(&item.name, &item.params);

                tokio::spawn(async move {
                    let context = ExportContext {
                        itemid: item.itemid,
                        client_id: item.client_id,
                        timeout: call_timeout,
                        expressions,
                    };

                    let result = if !allowed {
                        CheckResult::error(item.itemid, UNSUPPORTED_KEY)
                    } else {
                        let call = AssertUnwindSafe(exporter.export(&item.name, &item.params, &context))
                            .catch_unwind();
                        match timeout(call_timeout, call).await {
                            Ok(Ok(Ok(value))) => CheckResult::new(item.itemid, value),
                            Ok(Ok(Err(e))) => CheckResult::error(item.itemid, e.to_string()),
                            Ok(Err(_)) => {
                                error!("plugin {} panicked while exporting {}", plugin.name, item.key);
                                CheckResult::error(item.itemid, "Plugin failed unexpectedly.")
                            }
                            Err(_) => CheckResult::error(item.itemid, PluginError::Timeout.to_string()),
                        }
                    };

                    // the server's log position travels back with the value
                    let result = result.with_log(item.log);
                    let failed = result.value.is_error();
                    if failed {
                        trace!("item {} ({}) not supported: {:?}", item.itemid, item.key, result.error_message());
                    }
                    item.writer.write(result).await;

                    let _ = done_tx
                        .send(TaskDone {
                            id,
                            plugin: plugin.name.clone(),
                            weight,
                            failed,
                        })
                        .await;
                });
            }
        }
    }

    /// Release capacity and let the task schedule its own next run
    fn complete(&mut self, done: TaskDone, now: DateTime<Utc>) {
        self.completed += 1;
        if let Some(state) = self.plugins.get_mut(&done.plugin) {
            state.load = state.load.saturating_sub(done.weight);
        }

        let Some(task) = self.queue.get(done.id) else {
            trace!("task {} finished after removal", done.id);
            return;
        };

        let next = match &task.kind {
            TaskKind::Collector => {
                let period = task
                    .plugin
                    .capabilities
                    .collector()
                    .map(|c| c.period())
                    .unwrap_or(Duration::from_secs(1));
                Some(now + chrono::Duration::from_std(period).unwrap_or(chrono::Duration::seconds(1)))
            }
            TaskKind::Exporter(item) => Some(next_check(item, now, done.failed)),
            TaskKind::PassiveCheck(_) => None,
        };

        match next {
            Some(at) => {
                self.queue.requeue(done.id, at);
            }
            None => {
                self.queue.remove(done.id);
            }
        }
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            tasks: self.queue.len(),
            running: self.queue.len() - self.queue.idle_len(),
            clients: self.clients.len(),
            completed: self.completed,
        }
    }
}

/// Next run of an exporter task
///
/// A failed item waits at least its current delay before the next slot.
fn next_check(item: &ExportItem, now: DateTime<Utc>, failed: bool) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    let base = if failed {
        let delay = item.delay.current_delay(&local) as i64;
        local + chrono::Duration::seconds((delay - 1).max(0))
    } else {
        local
    };

    item.delay
        .next_check(item.itemid, &base)
        .unwrap_or_else(|| now + chrono::Duration::seconds(MAX_DELAY_SECS as i64))
}

/// Handle for controlling the SchedulerActor
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn spawn(registry: Arc<Registry>, gate: Arc<AccessGate>, config: SchedulerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = SchedulerActor::new(registry, gate, config, cmd_rx);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    /// Replace the item list of `client_id`; an empty list removes the client
    pub async fn update(
        &self,
        client_id: u64,
        writer: Arc<dyn ResultWriter>,
        requests: Vec<ItemRequest>,
        expressions: Arc<Expressions>,
    ) -> Result<UpdateSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::Update {
                client_id,
                writer,
                requests,
                expressions,
                respond_to: tx,
            })
            .await
            .context("failed to send Update command")?;

        rx.await.context("failed to receive update summary")
    }

    /// Evaluate `key` once; gives a not-supported result when the plugin
    /// does not answer within `wait`
    pub async fn check_once(&self, key: &str, wait: Duration) -> Result<CheckResult> {
        let (writer, rx) = SingleResult::channel();
        self.sender
            .send(SchedulerCommand::CheckOnce {
                key: key.to_string(),
                writer,
            })
            .await
            .context("failed to send CheckOnce command")?;

        match timeout(wait, rx).await {
            Ok(result) => result.context("scheduler dropped the single-shot check"),
            Err(_) => Ok(CheckResult::error(0, PluginError::Timeout.to_string())),
        }
    }

    pub async fn stats(&self) -> Option<SchedulerStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::GetStats { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(SchedulerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
