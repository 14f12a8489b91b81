use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use trading_firm_bus::api::{self, AppState};
use trading_firm_bus::bus::{
    ConsumeLoop, ConsumerConfig, JetStreamBus, MessageBus, MessageHandler, RedbBus,
};
use trading_firm_bus::clock::{SystemTimeProvider, TimeProvider};
use trading_firm_bus::codec::EnvelopeCodec;
use trading_firm_bus::config::{AgentRole, BusBackend, LoggingConfig, Settings};
use trading_firm_bus::coordination::{CoordinationStore, KvCoordination, RedbCoordination};
use trading_firm_bus::hold_gate::{HoldGate, HoldWriter};
use trading_firm_bus::persistence::RedbStore;
use trading_firm_bus::risk_watchdog::RiskWatchdog;
use trading_firm_bus::shutdown::ShutdownCoordinator;
use trading_firm_bus::signals::{KeywordScorer, SignalPath};
use trading_firm_bus::topics::{
    FILLS, GROUP_HOLD_GATE, GROUP_SIGNAL_MAKER, GROUP_WATCHDOG, NEWS_RAW, PLAYBOOK,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn init_logging(cfg: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if cfg.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("Logging already initialized: {}", e);
    }
}

async fn build_backends(
    settings: &Settings,
) -> Result<(Arc<dyn MessageBus>, Arc<dyn CoordinationStore>), BoxError> {
    let codec = EnvelopeCodec::new(settings.bus.wire_format);

    match settings.bus.backend {
        BusBackend::Redb => {
            // One file, one process: the log and the projection share the database.
            let db = Arc::new(RedbStore::new(&settings.bus.db_path)?);
            let bus = RedbBus::new(db.clone(), codec)?;
            let store = RedbCoordination::new(db, &settings.store.halt_key)?;
            Ok((Arc::new(bus), Arc::new(store)))
        }
        BusBackend::JetStream => {
            let bus = JetStreamBus::connect(
                &settings.bus.nats_url,
                codec,
                Duration::from_millis(settings.bus.ack_wait_ms),
            )
            .await?;
            let store = KvCoordination::connect(
                bus.context(),
                &settings.store.kv_bucket,
                &settings.store.halt_key,
            )
            .await?;
            Ok((Arc::new(bus), Arc::new(store)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv::dotenv().ok();

    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            init_logging(&LoggingConfig::default());
            error!("❌ Invalid configuration: {}", e);
            return Err(e.into());
        }
    };
    init_logging(&settings.logging);

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║               TRADING FIRM BUS                                ║");
    info!("║               Durable Event Bus & Coordination Agent          ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");
    info!(
        "Agent '{}' ({}) roles: {:?}",
        settings.agent.name, settings.agent.consumer_id, settings.agent.roles
    );

    let (bus, store) = build_backends(&settings).await.map_err(|e| {
        error!("❌ Failed to initialize backends: {}", e);
        e
    })?;
    info!("✅ Bus '{}' and store '{}' ready", bus.name(), store.name());

    let shutdown = ShutdownCoordinator::new();
    shutdown.listen_for_signals();

    let clock: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let gate = HoldGate::new(store.clone(), clock.clone());
    let consumer_config = ConsumerConfig::from(&settings.bus);

    // --- Consumer Roles ---
    let mut consumers = Vec::new();
    for role in &settings.agent.roles {
        let (topic, group, handler): (&str, &str, Arc<dyn MessageHandler>) = match role {
            AgentRole::Watchdog => {
                let watchdog =
                    RiskWatchdog::new(store.clone(), bus.clone(), settings.risk.max_notional_usd);
                watchdog.initialize().await?;
                (FILLS, GROUP_WATCHDOG, Arc::new(watchdog))
            }
            AgentRole::HoldGate => (
                PLAYBOOK,
                GROUP_HOLD_GATE,
                Arc::new(HoldWriter::new(store.clone(), clock.clone())),
            ),
            AgentRole::SignalMaker => (
                NEWS_RAW,
                GROUP_SIGNAL_MAKER,
                Arc::new(SignalPath::new(
                    bus.clone(),
                    gate.clone(),
                    Arc::new(KeywordScorer::default()),
                )),
            ),
        };

        let mut consume = ConsumeLoop::new(
            bus.clone(),
            topic,
            group,
            &settings.agent.consumer_id,
            consumer_config.clone(),
            shutdown.clone(),
        );
        let stop_all = shutdown.clone();
        let role = *role;
        consumers.push(tokio::spawn(async move {
            let result = consume.run(handler.as_ref()).await;
            if let Err(e) = &result {
                error!("❌ {:?} consumer failed: {}", role, e);
                stop_all.request_shutdown("consumer failure");
            }
            (role, result)
        }));
    }

    // --- Status API ---
    let api_task = if settings.api.enabled {
        let state = AppState {
            agent: settings.agent.name.clone(),
            bus: bus.clone(),
            store: store.clone(),
            gate: gate.clone(),
        };
        let server = api::serve(state, settings.api.port)?;
        let handle = server.handle();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            stopper.wait().await;
            handle.stop(true).await;
        });
        info!("🌐 Status API listening on 0.0.0.0:{}", settings.api.port);
        Some(tokio::spawn(server))
    } else {
        None
    };

    info!("🚀 Agent running. Press Ctrl-C to stop.");

    let mut failed = false;
    for task in consumers {
        match task.await {
            Ok((role, Ok(stats))) => info!("{:?} consumer finished: {:?}", role, stats),
            Ok((_, Err(_))) => failed = true,
            Err(e) => {
                error!("Consumer task aborted: {}", e);
                failed = true;
            }
        }
    }

    if let Some(task) = api_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Status API exited with error: {}", e),
            Err(e) => warn!("Status API task aborted: {}", e),
        }
    }

    info!(
        "🛑 Shutdown complete ({})",
        shutdown.reason().unwrap_or_else(|| "no reason recorded".into())
    );

    if failed {
        return Err("one or more consumers failed".into());
    }
    Ok(())
}
