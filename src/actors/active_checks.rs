//! ActiveChecksActor - Keeps the active check list in sync with one server cluster
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → "active checks" request → validate → SchedulerHandle::update
//!     ↑
//!     └─── Commands (RefreshNow, Shutdown)
//! ```
//!
//! The refresh loop and result delivery share one [`ServerLink`] per
//! cluster. Both rotate the address pool on failure and retry on their own
//! schedule; neither waits for the other.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use super::messages::ConnectorCommand;
use super::result_cache::{DataEnvelope, UploadError, Uploader};
use super::scheduler::SchedulerHandle;
use crate::VERSION;
use crate::address::{Address, AddressPool, DEFAULT_ACTIVE_PORT};
use crate::expression::{ExpressionEntry, ExpressionError, Expressions};
use crate::protocol::{ConnectOptions, exchange};
use crate::task::{ItemRequest, ResultWriter};

/// Problems with an "active checks" response
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("cannot parse response: {0}")]
    Malformed(String),

    #[error("server returned \"{response}\": {info}")]
    Failed { response: String, info: String },

    #[error("missing \"{field}\" for {item}")]
    MissingField { field: &'static str, item: String },

    #[error("invalid \"{field}\" for {item}: {value}")]
    InvalidField {
        field: &'static str,
        item: String,
        value: String,
    },

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Logs link failures once per transition instead of on every retry
#[derive(Debug, Default)]
pub struct LinkState {
    failing: bool,
}

impl LinkState {
    /// Returns `true` when this failure started a failing period
    pub fn failure(&mut self, what: &str, address: Option<&Address>, error: &dyn fmt::Display) -> bool {
        if self.failing {
            trace!("{} still failing: {}", what, error);
            return false;
        }
        self.failing = true;
        match address {
            Some(address) => warn!("{} to [{}] failed: {}", what, address, error),
            None => warn!("{} failed: {}", what, error),
        }
        true
    }

    /// Returns `true` when this success ended a failing period
    pub fn success(&mut self, what: &str, address: Option<&Address>) -> bool {
        if !self.failing {
            return false;
        }
        self.failing = false;
        match address {
            Some(address) => info!("{} to [{}] is working again", what, address),
            None => info!("{} is working again", what),
        }
        true
    }

    pub fn is_failing(&self) -> bool {
        self.failing
    }
}

#[derive(Debug, Deserialize)]
struct RedirectInfo {
    revision: Option<u64>,
    address: Option<String>,
    #[serde(default)]
    reset: bool,
}

#[derive(Debug, Deserialize)]
struct RedirectEnvelope {
    redirect: Option<RedirectInfo>,
}

/// One server cluster: its address pool and how to talk to it
#[derive(Debug)]
pub struct ServerLink {
    pool: Arc<AddressPool>,
    options: ConnectOptions,
    delivery: Mutex<LinkState>,
}

impl ServerLink {
    pub fn new(pool: Arc<AddressPool>, options: ConnectOptions) -> Self {
        Self {
            pool,
            options,
            delivery: Mutex::new(LinkState::default()),
        }
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Send one request to the current address and return the parsed reply
    /// along with the address last contacted, taken before any rotation
    ///
    /// A transport failure rotates the pool. A redirect updates the pool and
    /// the request is repeated once at the new head.
    #[instrument(skip_all)]
    pub async fn request_via(
        &self,
        payload: &[u8],
    ) -> (Option<Address>, Result<serde_json::Value, UploadError>) {
        let mut redirected = false;
        loop {
            let Some(address) = self.pool.get() else {
                return (None, Err(UploadError::NoAddress));
            };
            trace!("sending {} bytes to {}", payload.len(), address);

            let response = match exchange(&address, payload, &self.options).await {
                Ok(response) => response,
                Err(e) => {
                    if let Some(next) = self.pool.next() {
                        debug!("switching from {} to {}", address, next);
                    }
                    return (Some(address), Err(e.into()));
                }
            };

            let value: serde_json::Value = match serde_json::from_slice(&response) {
                Ok(value) => value,
                Err(e) => {
                    return (Some(address), Err(UploadError::InvalidResponse(e.to_string())));
                }
            };

            let redirect = serde_json::from_value::<RedirectEnvelope>(value.clone())
                .ok()
                .and_then(|envelope| envelope.redirect);
            let Some(redirect) = redirect else {
                return (Some(address), Ok(value));
            };

            if redirected {
                return (
                    Some(address),
                    Err(UploadError::InvalidResponse(
                        "redirected twice in one exchange".to_string(),
                    )),
                );
            }
            if let Err(e) = self.apply_redirect(redirect) {
                return (Some(address), Err(e));
            }
            redirected = true;
        }
    }

    fn apply_redirect(&self, redirect: RedirectInfo) -> Result<(), UploadError> {
        if redirect.reset {
            self.pool.reset();
            return Ok(());
        }

        let revision = redirect
            .revision
            .ok_or_else(|| UploadError::InvalidResponse("redirect without revision".to_string()))?;
        let text = redirect
            .address
            .ok_or_else(|| UploadError::InvalidResponse("redirect without address".to_string()))?;
        let target = Address::parse(&text, DEFAULT_ACTIVE_PORT)
            .map_err(|e| UploadError::InvalidResponse(e.to_string()))?;

        if !self.pool.add_redirect(target.host, target.port, revision) {
            return Err(UploadError::InvalidResponse(format!(
                "stale redirect revision {revision}"
            )));
        }
        Ok(())
    }

    fn delivery_state(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Uploader for ServerLink {
    async fn upload(&self, envelope: &DataEnvelope) -> Result<(), UploadError> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| UploadError::InvalidResponse(e.to_string()))?;

        let (address, result) = self.request_via(&payload).await;
        let result = result.and_then(|reply| {
            match reply.get("response").and_then(|r| r.as_str()) {
                Some("success") => Ok(()),
                _ => Err(UploadError::Rejected(
                    reply
                        .get("info")
                        .and_then(|i| i.as_str())
                        .unwrap_or("no details")
                        .to_string(),
                )),
            }
        });

        match &result {
            Ok(()) => {
                self.delivery_state().success("sending of active check data", address.as_ref());
                trace!("delivered {} values", envelope.data.len());
            }
            Err(e) => {
                self.delivery_state()
                    .failure("sending of active check data", address.as_ref(), e);
            }
        }
        result
    }
}

#[derive(Debug, Clone)]
pub struct ActiveChecksConfig {
    pub hostname: String,
    pub host_metadata: Option<String>,
    pub host_interface: Option<String>,
    pub listen_ip: Option<String>,
    pub listen_port: Option<u16>,
    pub refresh: Duration,
}

impl ActiveChecksConfig {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            host_metadata: None,
            host_interface: None,
            listen_ip: None,
            listen_port: None,
            refresh: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize)]
struct ActiveChecksRequest<'a> {
    request: &'static str,
    host: &'a str,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    host_metadata: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interface: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    config_revision: u64,
    session: &'a str,
}

#[derive(Debug, Deserialize)]
struct ActiveChecksResponse {
    response: Option<String>,
    info: Option<String>,
    config_revision: Option<u64>,
    data: Option<Vec<RawItem>>,
    regexp: Option<Vec<RawExpression>>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    key: Option<String>,
    itemid: Option<u64>,
    delay: Option<serde_json::Value>,
    lastlogsize: Option<u64>,
    mtime: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawExpression {
    name: Option<String>,
    expression: Option<String>,
    expression_type: Option<i64>,
    exp_delimiter: Option<String>,
    case_sensitive: Option<i64>,
}

/// A validated active check list
#[derive(Debug)]
pub struct CheckList {
    pub revision: Option<u64>,
    /// `None` when the server confirmed the current list is still valid
    pub items: Option<Vec<ItemRequest>>,
    pub expressions: Vec<ExpressionEntry>,
}

/// Validate an "active checks" reply
///
/// Fails on the first missing or malformed field; nothing of a rejected
/// reply is used.
pub fn parse_check_list(reply: serde_json::Value, current_revision: u64) -> Result<CheckList, ResponseError> {
    let response: ActiveChecksResponse =
        serde_json::from_value(reply).map_err(|e| ResponseError::Malformed(e.to_string()))?;

    match response.response.as_deref() {
        Some("success") => {}
        other => {
            return Err(ResponseError::Failed {
                response: other.unwrap_or("").to_string(),
                info: response.info.unwrap_or_else(|| "no details".to_string()),
            });
        }
    }

    let Some(data) = response.data else {
        if response.config_revision == Some(current_revision) {
            return Ok(CheckList {
                revision: response.config_revision,
                items: None,
                expressions: Vec::new(),
            });
        }
        return Err(ResponseError::MissingField {
            field: "data",
            item: "response".to_string(),
        });
    };

    let mut items = Vec::with_capacity(data.len());
    for (index, raw) in data.into_iter().enumerate() {
        let item = match (&raw.itemid, &raw.key) {
            (Some(itemid), _) => format!("itemid {itemid}"),
            (None, Some(key)) => format!("key \"{key}\""),
            (None, None) => format!("item #{index}"),
        };
        let missing = |field| ResponseError::MissingField {
            field,
            item: item.clone(),
        };

        let key = raw.key.ok_or_else(|| missing("key"))?;
        let itemid = raw.itemid.ok_or_else(|| missing("itemid"))?;
        let delay = match raw.delay.ok_or_else(|| missing("delay"))? {
            serde_json::Value::String(text) => text,
            serde_json::Value::Number(number) => number.to_string(),
            other => {
                return Err(ResponseError::InvalidField {
                    field: "delay",
                    item: item.clone(),
                    value: other.to_string(),
                });
            }
        };
        let lastlogsize = raw.lastlogsize.ok_or_else(|| missing("lastlogsize"))?;
        let mtime = raw.mtime.ok_or_else(|| missing("mtime"))?;

        items.push(ItemRequest {
            itemid,
            key,
            delay,
            lastlogsize,
            mtime,
        });
    }

    let mut expressions = Vec::new();
    for (index, raw) in response.regexp.unwrap_or_default().into_iter().enumerate() {
        let item = match &raw.name {
            Some(name) => format!("expression \"{name}\""),
            None => format!("expression #{index}"),
        };
        let missing = |field| ResponseError::MissingField {
            field,
            item: item.clone(),
        };

        let name = raw.name.ok_or_else(|| missing("name"))?;
        let expression = raw.expression.ok_or_else(|| missing("expression"))?;
        let expression_type = raw.expression_type.ok_or_else(|| missing("expression_type"))?;
        let delimiter = raw.exp_delimiter.ok_or_else(|| missing("exp_delimiter"))?;
        if delimiter.chars().count() > 1 {
            return Err(ResponseError::InvalidField {
                field: "exp_delimiter",
                item: item.clone(),
                value: delimiter,
            });
        }
        let case_sensitive = raw.case_sensitive.ok_or_else(|| missing("case_sensitive"))?;

        expressions.push(ExpressionEntry {
            name,
            expression,
            expression_type,
            delimiter,
            case_sensitive: case_sensitive != 0,
        });
    }

    Ok(CheckList {
        revision: response.config_revision,
        items: Some(items),
        expressions,
    })
}

pub struct ActiveChecksActor {
    config: ActiveChecksConfig,
    link: Arc<ServerLink>,
    scheduler: SchedulerHandle,
    writer: Arc<dyn ResultWriter>,
    client_id: u64,
    command_rx: mpsc::Receiver<ConnectorCommand>,
    session: String,
    revision: u64,
    state: LinkState,
}

impl ActiveChecksActor {
    pub fn new(
        config: ActiveChecksConfig,
        link: Arc<ServerLink>,
        scheduler: SchedulerHandle,
        writer: Arc<dyn ResultWriter>,
        client_id: u64,
        command_rx: mpsc::Receiver<ConnectorCommand>,
    ) -> Self {
        Self {
            config,
            link,
            scheduler,
            writer,
            client_id,
            command_rx,
            session: uuid::Uuid::new_v4().simple().to_string(),
            revision: 0,
            state: LinkState::default(),
        }
    }

    #[instrument(skip(self), fields(client = self.client_id))]
    pub async fn run(mut self) {
        debug!(
            "starting active checks for {:?} every {:?}",
            self.link.pool().addresses(),
            self.config.refresh
        );

        let mut ticker = time::interval(self.config.refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        trace!("refresh failed: {:#}", e);
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ConnectorCommand::RefreshNow { respond_to }) => {
                            debug!("received RefreshNow command");
                            let _ = respond_to.send(self.refresh().await);
                        }

                        Some(ConnectorCommand::Shutdown) => {
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

        if let Err(e) = self
            .scheduler
            .update(self.client_id, self.writer.clone(), Vec::new(), Arc::default())
            .await
        {
            trace!("cannot drop active checks: {:#}", e);
        }
        debug!("active checks stopped");
    }

    async fn refresh(&mut self) -> Result<()> {
        let request = ActiveChecksRequest {
            request: "active checks",
            host: &self.config.hostname,
            version: VERSION,
            host_metadata: self.config.host_metadata.as_deref(),
            interface: self.config.host_interface.as_deref(),
            ip: self.config.listen_ip.as_deref(),
            port: self.config.listen_port,
            config_revision: self.revision,
            session: &self.session,
        };
        let payload = serde_json::to_vec(&request).context("failed to encode request")?;

        let (address, reply) = self.link.request_via(&payload).await;
        let reply = match reply {
            Ok(reply) => {
                self.state
                    .success("active check configuration update", address.as_ref());
                reply
            }
            Err(e) => {
                self.state
                    .failure("active check configuration update", address.as_ref(), &e);
                return Err(e).context("active check request failed");
            }
        };

        let list = match parse_check_list(reply, self.revision) {
            Ok(list) => list,
            Err(e) => {
                warn!("cannot use active check configuration: {}", e);
                return Err(e).context("invalid active check configuration");
            }
        };

        let Some(items) = list.items else {
            trace!("active checks unchanged at revision {}", self.revision);
            return Ok(());
        };

        let expressions = Expressions::compile(&list.expressions).map_err(|e| {
            warn!("cannot use active check configuration: {}", e);
            e
        })?;

        let summary = self
            .scheduler
            .update(
                self.client_id,
                self.writer.clone(),
                items,
                Arc::new(expressions),
            )
            .await?;
        debug!(
            "active checks updated: {} added, {} updated, {} removed, {} skipped",
            summary.added, summary.updated, summary.removed, summary.skipped
        );

        if let Some(revision) = list.revision {
            self.revision = revision;
        }
        Ok(())
    }
}

/// Handle for controlling the ActiveChecksActor
#[derive(Clone)]
pub struct ActiveChecksHandle {
    sender: mpsc::Sender<ConnectorCommand>,
}

impl ActiveChecksHandle {
    pub fn spawn(
        config: ActiveChecksConfig,
        link: Arc<ServerLink>,
        scheduler: SchedulerHandle,
        writer: Arc<dyn ResultWriter>,
        client_id: u64,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = ActiveChecksActor::new(config, link, scheduler, writer, client_id, cmd_rx);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    pub async fn refresh_now(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectorCommand::RefreshNow { respond_to: tx })
            .await
            .context("failed to send RefreshNow command")?;

        rx.await.context("failed to receive refresh result")?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ConnectorCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
