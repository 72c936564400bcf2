use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use hostwatch::{
    Value,
    actors::{
        active_checks::{ActiveChecksConfig, ActiveChecksHandle, ServerLink},
        listener::{ListenerConfig, ListenerHandle, PeerFilter},
        result_cache::{CacheConfig, ResultCacheHandle, Uploader},
        scheduler::{SchedulerConfig, SchedulerHandle},
    },
    access::AccessGate,
    address::AddressPool,
    config::{Config, read_config_file},
    plugin::Registry,
    protocol::{AcceptOptions, ConnectOptions, TlsMode, TlsRegistry},
    storage::PersistentBuffer,
    util::{apply_env_overrides, get_config_path, system_hostname},
};
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(name = "hostwatch-agent", version, about)]
struct Args {
    /// Config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Evaluate one item key and exit
    #[arg(short, long, value_name = "KEY", conflicts_with = "print")]
    test: Option<String>,

    /// Evaluate every built-in item key and exit
    #[arg(short, long)]
    print: bool,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("hostwatch", level),
        ("hostwatch_agent", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<Config> {
    let required = explicit.is_some();
    let path = get_config_path(explicit);

    let mut config = if path.exists() || required {
        read_config_file(&path).with_context(|| format!("cannot load \"{}\"", path.display()))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let config = load_config(args.config.clone())?;

    let one_off = args.test.is_some() || args.print;
    init(if one_off {
        LevelFilter::WARN.min(config.level_filter())
    } else {
        config.level_filter()
    });
    trace!("started with args: {args:?}");

    let hostname = config.hostname.clone().unwrap_or_else(system_hostname);

    let mut registry = Registry::with_builtins(&hostname);
    for (plugin, capacity) in &config.plugin_capacity {
        if !registry.set_capacity(plugin, *capacity) {
            warn!("cannot set capacity of unknown plugin \"{}\"", plugin);
        }
    }
    let registry = Arc::new(registry);
    let gate = Arc::new(config.access_gate()?);

    let scheduler = SchedulerHandle::spawn(
        registry.clone(),
        gate.clone(),
        SchedulerConfig {
            timeout: config.timeout(),
            ..SchedulerConfig::default()
        },
    );

    if one_off {
        let keys = match &args.test {
            Some(key) => vec![key.clone()],
            None => registry.printable_keys(),
        };
        for key in keys {
            print_check(&scheduler, &key, config.timeout()).await?;
        }
        scheduler.shutdown().await?;
        return Ok(());
    }

    run_agent(config, args.config, hostname, gate, scheduler).await
}

async fn print_check(scheduler: &SchedulerHandle, key: &str, timeout: Duration) -> anyhow::Result<()> {
    let result = scheduler.check_once(key, timeout).await?;
    match &result.value {
        Value::Error(message) => println!("{key:<46}[ZBX_NOTSUPPORTED] [{message}]"),
        value => {
            let kind = match value {
                Value::Unsigned(_) => 'u',
                Value::Float(_) => 'd',
                _ => 's',
            };
            println!("{key:<46}[{kind}|{}]", value.render().unwrap_or_default());
        }
    }
    Ok(())
}

/// Persistent buffer for cluster `index`; clusters after the first get their own file
async fn open_persistent(config: &Config, index: usize) -> anyhow::Result<Option<Arc<dyn PersistentBuffer>>> {
    if !config.enable_persistent_buffer {
        return Ok(None);
    }

    let path = match index {
        0 => config.persistent_buffer_file.clone(),
        n => config.persistent_buffer_file.with_extension(format!("{n}.db")),
    };

    open_sqlite(&path).await.map(Some)
}

#[cfg(feature = "persistent-buffer")]
async fn open_sqlite(path: &Path) -> anyhow::Result<Arc<dyn PersistentBuffer>> {
    let buffer = hostwatch::storage::sqlite::SqliteBuffer::new(path).await?;
    Ok(Arc::new(buffer))
}

#[cfg(not(feature = "persistent-buffer"))]
async fn open_sqlite(path: &Path) -> anyhow::Result<Arc<dyn PersistentBuffer>> {
    bail!(
        "\"enable_persistent_buffer\" is set but this build has no persistent buffer support ({})",
        path.display()
    )
}

async fn run_agent(
    config: Config,
    config_path: Option<PathBuf>,
    hostname: String,
    gate: Arc<AccessGate>,
    scheduler: SchedulerHandle,
) -> anyhow::Result<()> {
    let contexts = Arc::new(TlsRegistry::new(config.tls_contexts()?));
    let uses_psk = config.tls_connect == TlsMode::Psk || config.tls_accept.contains(&TlsMode::Psk);
    if uses_psk && contexts.snapshot().psk_backend.is_none() {
        warn!("this build has no TLS-PSK support (feature \"tls-psk\"); PSK connections will fail");
    }

    let connect = ConnectOptions {
        timeout: config.timeout(),
        tls_mode: config.tls_connect,
        contexts: contexts.clone(),
        compress: true,
        max_message_size: config.max_message_size,
    };

    let clusters = config.server_clusters()?;
    if clusters.is_empty() && config.start_agents == 0 {
        bail!("neither \"server_active\" nor the passive listener is configured");
    }

    let mut caches = Vec::new();
    let mut connectors = Vec::new();
    for (index, addresses) in clusters.into_iter().enumerate() {
        info!("active checks enabled for {:?}", addresses);
        let link = Arc::new(ServerLink::new(
            Arc::new(AddressPool::new(addresses)),
            connect.clone(),
        ));

        let cache = ResultCacheHandle::spawn(
            CacheConfig {
                hostname: hostname.clone(),
                buffer_size: config.buffer_size,
                capacity: config.buffer_capacity(),
                send_period: Duration::from_secs(config.buffer_send),
                persistent_period: Duration::from_secs(config.persistent_buffer_period),
            },
            Some(link.clone() as Arc<dyn Uploader>),
            open_persistent(&config, index).await?,
        );

        let connector = ActiveChecksHandle::spawn(
            ActiveChecksConfig {
                hostname: hostname.clone(),
                host_metadata: config.host_metadata.clone(),
                host_interface: config.host_interface.clone(),
                listen_ip: None,
                listen_port: (config.start_agents > 0).then_some(config.listen_port),
                refresh: Duration::from_secs(config.refresh_active_checks),
            },
            link,
            scheduler.clone(),
            Arc::new(cache.clone()),
            index as u64 + 1,
        );

        caches.push(cache);
        connectors.push(connector);
    }

    let listener = if config.start_agents > 0 {
        let peers = PeerFilter::resolve(&config.server).await?;
        if config.server.is_empty() {
            warn!("\"server\" is empty; passive checks are accepted from any peer");
        }
        let listener = ListenerHandle::spawn(
            ListenerConfig {
                bind: SocketAddr::new(config.listen_ip, config.listen_port),
                peers,
                accept: AcceptOptions {
                    timeout: config.timeout(),
                    accept: config.tls_accept.clone(),
                    contexts: contexts.clone(),
                    max_message_size: config.max_message_size,
                },
                timeout: config.timeout(),
            },
            scheduler.clone(),
        )
        .await?;
        Some(listener)
    } else {
        None
    };

    info!("hostwatch agent {} started as \"{}\"", hostwatch::VERSION, hostname);
    wait_for_shutdown(config_path, &gate, &contexts).await?;
    info!("shutting down");

    if let Some(listener) = listener {
        listener.shutdown().await?;
    }
    for connector in &connectors {
        connector.shutdown().await?;
    }
    for cache in &caches {
        if let Err(e) = cache.shutdown().await {
            error!("result cache did not stop cleanly: {:#}", e);
        }
    }
    if let Some(stats) = scheduler.stats().await {
        debug!("scheduler completed {} tasks", stats.completed);
    }
    scheduler.shutdown().await?;

    Ok(())
}

/// Re-read the configuration file; access rules and TLS material are swapped in
#[cfg(unix)]
fn reload(config_path: Option<PathBuf>, gate: &AccessGate, tls: &TlsRegistry) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    config.apply_reloadable(gate, tls)?;
    Ok(())
}

/// Block until Ctrl-C, reloading on SIGHUP
#[cfg(unix)]
async fn wait_for_shutdown(
    config_path: Option<PathBuf>,
    gate: &AccessGate,
    tls: &TlsRegistry,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("cannot listen for SIGHUP")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                return result.context("cannot listen for the shutdown signal");
            }
            _ = hangup.recv() => {
                info!("reloading configuration");
                if let Err(e) = reload(config_path.clone(), gate, tls) {
                    error!("configuration reload failed, keeping current settings: {:#}", e);
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(
    _config_path: Option<PathBuf>,
    _gate: &AccessGate,
    _tls: &TlsRegistry,
) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for the shutdown signal")
}
