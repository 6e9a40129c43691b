//! Runtime assembly: bind the socket, wire the pipeline stages and the
//! background tasks, run until told to stop.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use box_control::nat::{NatCoordinator, NatSettings};
use box_control::{LocationIndex, NatState, PresencePublisher, PresenceStatus};
use box_core::config::{BoxConfig, Origin, Sourced, TransportModeConfig};
use box_core::paths::BoxPaths;
use box_core::{NodeId, UserId};
use box_crypto::Identity;
use box_store::QueueStore;
use box_transport::{SecureTransport, TransportMode};

use crate::admin::AdminServer;
use crate::broker::{Broker, BrokerContext};
use crate::logging::{LogHandle, LogTarget};
use crate::pipeline::{self, Counters, SendQueue};

/// Effective options after CLI parsing; merged onto config/env/defaults.
#[derive(Debug, Default, Clone)]
pub struct RuntimeOptions {
    pub home: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

/// A started daemon: its tasks and the shutdown switch.
pub struct Runtime {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pub listen_addr: SocketAddr,
    pub node_id: NodeId,
    pub user_id: UserId,
}

impl Runtime {
    /// Build and launch every stage. Returns once the socket is bound and
    /// all tasks are running.
    pub async fn start(options: RuntimeOptions) -> anyhow::Result<Self> {
        let paths = match &options.home {
            Some(home) => BoxPaths::new(home),
            None => BoxPaths::from_env()?,
        };
        paths.ensure().context("creating ~/.box tree")?;

        let config_path = options
            .config
            .clone()
            .unwrap_or_else(|| paths.config_file());
        let config = BoxConfig::load_or_default(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;

        // Merge precedence: CLI > env > config > default.
        let mut port = Sourced::default_value(BoxConfig::default().network.listen_port);
        port.merge(Some(config.network.listen_port), Origin::Config);
        port.merge(
            std::env::var("BOX_PORT").ok().and_then(|v| v.parse().ok()),
            Origin::Env,
        );
        port.merge(options.port, Origin::Cli);

        let mut log_level = Sourced::default_value(BoxConfig::default().log.level);
        log_level.merge(Some(config.log.level.clone()), Origin::Config);
        log_level.merge(std::env::var("BOX_LOG_LEVEL").ok(), Origin::Env);
        log_level.merge(options.log_level.clone(), Origin::Cli);

        let log_target = LogTarget::parse(&config.log.target)
            .map_err(|e| anyhow::anyhow!("log target: {e}"))?;
        let log = LogHandle::init(&log_level.value, log_target)?;
        info!(
            port = port.value,
            origin = ?port.origin,
            "boxd starting"
        );

        // Identity material: node key pair (and the client pair, so first
        // launch provisions both files).
        let node_identity = Identity::load_or_generate(&paths.node_identity_file())?;
        let client_identity = Identity::load_or_generate(&paths.client_identity_file())?;
        let node_id = NodeId(node_identity.derived_uuid());
        let user_id = config
            .user_id
            .map(UserId)
            .unwrap_or_else(|| UserId(client_identity.derived_uuid()));

        let mode = match config.network.mode {
            TransportModeConfig::Clear => TransportMode::Clear,
            TransportModeConfig::Psk => {
                let psk = config
                    .network
                    .psk
                    .as_deref()
                    .context("psk mode without a psk")?;
                TransportMode::psk(psk.as_bytes())
            }
        };
        // IPv6-first: one dual-stack socket, with a v4 fallback for hosts
        // without an IPv6 stack.
        let bind_v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port.value);
        let transport = match SecureTransport::bind(bind_v6, mode.clone()) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(error = %e, "ipv6 bind failed, falling back to ipv4");
                let bind_v4 =
                    SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port.value);
                SecureTransport::bind(bind_v4, mode)
                    .with_context(|| format!("binding udp {bind_v4}"))?
            }
        };
        let listen_addr = transport.local_addr()?;
        let (reader, writer) = transport.split();
        info!(%listen_addr, "broker listening");

        let store = QueueStore::open(
            paths.queues_dir(),
            config.queues.permanent.clone(),
            config.queues.max_object_bytes,
        )
        .map_err(|e| anyhow::anyhow!("storage unavailable: {e}"))?;
        let index = LocationIndex::new(config.presence.stale_threshold_ms);

        let capacity = config.runtime.event_queue_capacity;
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (admin_tx, admin_rx) = mpsc::channel(16);
        let send_queue = SendQueue::new(capacity);
        let counters = Arc::new(Counters::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (nat_tx, nat_rx) = watch::channel(NatState::default());
        let (presence_status_tx, presence_status_rx) = watch::channel(PresenceStatus::default());

        let ctx = BrokerContext {
            node_id,
            user_id,
            listen_port: listen_addr.port(),
            queue_root: paths.queues_dir(),
            config_path: config_path.clone(),
            started_at: chrono::Utc::now(),
            presence_status: presence_status_rx,
            nat_state: nat_rx.clone(),
        };

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(pipeline::network_input(
            reader,
            event_tx.clone(),
            counters.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(
            Broker::new(store, index, send_queue.clone(), counters.clone(), ctx)
                .run(event_rx, admin_rx),
        ));
        tasks.push(tokio::spawn(pipeline::network_output(
            writer,
            send_queue.clone(),
            counters.clone(),
        )));

        // Presence publisher talks to the output stage through a forwarder,
        // so box-control stays free of daemon queue types.
        let (presence_out_tx, mut presence_out_rx) = mpsc::channel::<(SocketAddr, Vec<u8>)>(64);
        let forward_queue = send_queue.clone();
        tasks.push(tokio::spawn(async move {
            while let Some((peer, datagram)) = presence_out_rx.recv().await {
                forward_queue.push(peer, datagram);
            }
        }));

        let resolvers = parse_resolvers(&config.presence.root_resolvers);
        let publisher = PresencePublisher {
            node_id,
            user_id,
            listen_port: listen_addr.port(),
            resolvers,
            interval: Duration::from_secs(config.presence.publish_interval_s.max(1)),
            node_public_key: Some(hex::encode(node_identity.public_key())),
            nat_enabled: config.nat.enabled,
            outbox: presence_out_tx,
            nat_state: nat_rx,
            status_tx: presence_status_tx,
        };
        tasks.push(tokio::spawn(publisher.run(shutdown_rx.clone())));

        let coordinator = NatCoordinator::new(
            NatSettings {
                enabled: config.nat.enabled,
                gateway_override: config.nat.gateway,
                internal_port: listen_addr.port(),
                lease_s: config.nat.lease_s,
            },
            nat_tx,
        );
        tasks.push(tokio::spawn(coordinator.run(shutdown_rx.clone())));

        let admin = AdminServer {
            socket_path: paths.admin_socket(),
            broker: admin_tx,
            log,
            nat_gateway_override: config.nat.gateway,
            nat_internal_port: listen_addr.port(),
        };
        tasks.push(tokio::spawn(admin.run(shutdown_rx)));

        Ok(Self {
            shutdown_tx,
            tasks,
            listen_addr,
            node_id,
            user_id,
        })
    }

    /// Block until ctrl-c, then stop in bounded time.
    pub async fn run_until_signal(self) -> anyhow::Result<()> {
        tokio::signal::ctrl_c().await.context("signal handler")?;
        info!("shutdown requested");
        self.stop().await;
        Ok(())
    }

    /// Signal every stage and wait for the drain, 10 s ceiling.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .is_err()
            {
                warn!("task did not stop within the drain window");
            }
        }
        info!("boxd stopped");
    }
}

fn parse_resolvers(raw: &[String]) -> Vec<SocketAddr> {
    let mut resolvers = Vec::with_capacity(raw.len());
    for entry in raw {
        match entry.parse() {
            Ok(addr) => resolvers.push(addr),
            // No DNS by design: resolvers must be ip:port literals.
            Err(e) => warn!(%entry, error = %e, "ignoring unparseable root resolver"),
        }
    }
    resolvers
}
