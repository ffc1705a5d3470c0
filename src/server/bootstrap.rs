use crate::config;
use crate::{discovery, server};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → resolve → watch → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: build state (connects to etcd but does not register yet).
    let gateway = config::GatewayConfig::load(&args.config_path)?;
    let state = server::GatewayState::new(gateway).await?;

    // Phase 2: load the route table synchronously — instance discovery below
    // is driven off the service names routes reference, so routes must be
    // in place first.
    load_initial_routes(&state).await?;
    poll_consul_services(&state).await?;
    tracing::info!("discovery: consul: initial resolve completed");

    // Phase 3: start continuous watchers — all loops owned here.
    let shutdown = Arc::new(Notify::new());
    start_route_watcher(&state, &shutdown);
    start_discovery_loop(&state, &shutdown);

    // Phase 4: register in etcd + start keepalive/watch (quota splitting starts here).
    start_instance_registry(&state.infra, &shutdown).await?;

    // Phase 5: self-registration + admin/proxy servers.
    let consul_registry = setup_consul_registry(&state, &args).await;
    if let Some(ref reg) = consul_registry {
        start_consul_heartbeat(reg.clone(), &shutdown);
    }
    start_admin_server(&state, &args);

    tracing::info!("server: starting gateway, listen={}", args.listen);

    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    // Phase 6: block until signal, then clean up.
    wait_for_shutdown(&shutdown).await;

    // Graceful shutdown.
    state.infra.shutdown().await;
    if let Some(ref reg) = consul_registry {
        if let Err(e) = reg.deregister().await {
            tracing::error!("consul: deregister on shutdown failed: {}", e);
        }
    }

    // Wait for proxy to finish draining.
    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

// ---------------------------------------------------------------------------
// Route config (etcd) — one-shot initial load plus a reconnecting watch
// loop, both applying through `GatewayState::apply_route_definitions`.
// ---------------------------------------------------------------------------

async fn load_initial_routes(state: &server::GatewayState) -> Result<()> {
    let Some(etcd) = state.infra.etcd_client() else {
        tracing::info!("etcd: initial route load skipped, no endpoints configured");
        return Ok(());
    };

    let etcd_cfg = state.config.load().etcd.clone();
    let prefixes = config::etcd::compute_prefixes(&etcd_cfg);
    let initial = config::etcd::initial_load(etcd, &prefixes).await?;

    state.apply_route_definitions(initial.routes);
    if let Some(reg) = state.infra.instance_registry() {
        reg.set_config_revision(initial.meta_revision.max(0));
    }
    Ok(())
}

fn start_route_watcher(state: &server::GatewayState, shutdown: &Arc<Notify>) {
    let Some(etcd) = state.infra.etcd_client().cloned() else {
        tracing::info!("etcd: route watcher skipped, no endpoints configured");
        return;
    };

    let etcd_cfg = state.config.load().etcd.clone();
    let prefixes = config::etcd::compute_prefixes(&etcd_cfg);

    let state = state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        let mut revision: i64 = 0;

        loop {
            tracing::info!("etcd: route watch starting, revision={}", revision);

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

            let etcd_c = etcd.clone();
            let prefixes_c = config::etcd::EtcdPrefixes {
                route_prefix: prefixes.route_prefix.clone(),
                meta_revision_key: prefixes.meta_revision_key.clone(),
            };
            let watch_handle = tokio::spawn(async move {
                config::etcd::watch_once(&etcd_c, &prefixes_c, revision, tx).await
            });

            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Some(config::etcd::ConfigEvent::RoutesChanged(routes)) => {
                                state.apply_route_definitions(routes);
                                metrics::counter!(
                                    "gateway_config_reloads_total",
                                    "source" => "etcd", "result" => "success",
                                ).increment(1);
                            }
                            Some(config::etcd::ConfigEvent::MetaRevision(rev)) => {
                                if let Some(reg) = state.infra.instance_registry() {
                                    reg.set_config_revision(rev);
                                }
                            }
                            Some(config::etcd::ConfigEvent::ParseError { .. }) => {
                                metrics::counter!(
                                    "gateway_config_reloads_total",
                                    "source" => "etcd", "result" => "error",
                                ).increment(1);
                            }
                            None => break, // channel closed, watch ended
                        }
                    }
                    _ = shutdown.notified() => {
                        watch_handle.abort();
                        return;
                    }
                }
            }

            match watch_handle.await {
                Ok(Ok(new_rev)) => {
                    revision = new_rev;
                    tracing::warn!("etcd: route watch stream ended, reconnecting...");
                }
                Ok(Err(e)) => {
                    tracing::error!("etcd: route watch error, retrying in 5s, error={}", e);
                }
                Err(e) => {
                    tracing::error!("etcd: route watch task panicked: {}", e);
                }
            }

            if sleep_or_shutdown(std::time::Duration::from_secs(5), &shutdown).await {
                return;
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Consul service discovery — reads the registry's route-derived service
// names, queries Consul, and writes instance sets back into the registry.
// ---------------------------------------------------------------------------

/// Single round of consul service discovery, run against every service name
/// the current route table references.
async fn poll_consul_services(state: &server::GatewayState) -> anyhow::Result<()> {
    let client = state.consul_client();
    let service_names = state.registry.service_names();

    for service_name in &service_names {
        let start = std::time::Instant::now();

        let nodes = match client.query_healthy_services(service_name).await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(
                    "discovery: consul: query failed, service={}, error={}",
                    service_name, e
                );
                metrics::counter!(
                    "gateway_consul_poll_total",
                    "service_name" => service_name.clone(),
                    "result" => "error",
                )
                .increment(1);
                continue;
            }
        };

        let duration = start.elapsed().as_secs_f64();
        tracing::info!(
            "discovery: consul: queried, service={}, nodes={}, duration={:.3}s",
            service_name, nodes.len(), duration,
        );
        metrics::counter!(
            "gateway_consul_poll_total",
            "service_name" => service_name.clone(),
            "result" => "success",
        )
        .increment(1);

        let instances: Vec<config::ServiceInstance> = nodes.iter().map(to_service_instance).collect();

        metrics::gauge!(
            "gateway_consul_discovered_nodes",
            "service_name" => service_name.clone(),
        )
        .set(instances.len() as f64);

        state.registry.update_service(config::ServiceDefinition {
            service_name: service_name.clone(),
            metadata: Default::default(),
        });
        state.registry.update_instances(service_name, instances);
    }

    Ok(())
}

fn to_service_instance(n: &discovery::ConsulServiceNode) -> config::ServiceInstance {
    let weight = n
        .service_meta
        .get("weight")
        .and_then(|w| w.parse::<u32>().ok())
        .unwrap_or(100);

    let threshold = n
        .service_meta
        .get("threshold")
        .and_then(|t| t.parse::<f64>().ok())
        .unwrap_or(0.0);

    let gray = n
        .service_meta
        .get("gray")
        .map(|g| g == "true")
        .unwrap_or(false);

    config::ServiceInstance {
        instance_id: n.service_id.clone(),
        ip: n.service_address.clone(),
        port: n.service_port,
        weight,
        threshold,
        enabled: true,
        gray,
    }
}

// ---------------------------------------------------------------------------
// Loop owners — each function spawns a task with the retry/interval loop.
// The etcd/consul/upstream modules only provide single-shot operations.
// ---------------------------------------------------------------------------

/// Sleep for `duration`, but return `true` immediately if shutdown is signalled.
/// Returns `false` if the full duration elapsed normally.
async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

fn start_discovery_loop(state: &server::GatewayState, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let wake = state.infra.discovery_wake();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            let poll_interval = state.config.load().consul.poll_interval_secs;

            match poll_consul_services(&state).await {
                Ok(_) => tracing::debug!("discovery: consul: poll completed"),
                Err(e) => tracing::error!("discovery: consul: poll failed, error={}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(poll_interval)) => {}
                _ = wake.notified() => {
                    tracing::info!("discovery: consul: immediate poll triggered by config reload");
                }
                _ = shutdown.notified() => return,
            }
        }
    });
}

async fn start_instance_registry(infra: &server::InfraState, shutdown: &Arc<Notify>) -> Result<()> {
    let Some(registry) = infra.instance_registry() else {
        return Ok(());
    };

    let count = registry.register().await?;
    tracing::info!("instance_registry: registered, peers={}", count);

    // Keepalive loop.
    {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        let interval = registry.keepalive_interval();

        tokio::spawn(async move {
            loop {
                if sleep_or_shutdown(interval, &shutdown).await {
                    return;
                }
                if let Err(e) = registry.keepalive_once().await {
                    tracing::error!("instance_registry: keepalive cycle failed: {}", e);
                }
            }
        });
    }

    // Watch loop.
    {
        let registry = registry.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = registry.watch_instances_once() => {
                        tracing::warn!("instance_registry: watch stream ended, reconnecting...");
                    }
                    _ = shutdown.notified() => return,
                }
                tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            }
        });
    }

    Ok(())
}

fn start_consul_heartbeat(registry: Arc<discovery::ConsulRegistry>, shutdown: &Arc<Notify>) {
    let shutdown = shutdown.clone();
    let interval = registry.heartbeat_interval();

    tokio::spawn(async move {
        // Initial TTL pass.
        if let Err(e) = registry.pass_ttl().await {
            tracing::error!("consul: initial TTL pass failed: {}", e);
        }

        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                tracing::info!("consul: heartbeat shutdown signal received");
                return;
            }

            match registry.pass_ttl().await {
                Ok(_) => tracing::debug!("consul: TTL heartbeat sent"),
                Err(e) => {
                    tracing::error!("consul: TTL heartbeat failed: {}", e);
                    // Re-register in case the service was removed.
                    if let Err(re) = registry.register().await {
                        tracing::error!("consul: re-register failed: {}", re);
                    }
                }
            }
        }
    });
}

fn start_admin_server(state: &server::GatewayState, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn setup_consul_registry(
    state: &server::GatewayState,
    args: &BootstrapArgs,
) -> Option<Arc<discovery::ConsulRegistry>> {
    let cfg = state.config.load();
    if !cfg.registration.enabled {
        tracing::info!("consul: self-registration disabled");
        return None;
    }

    let client = discovery::ConsulClient::new(
        &cfg.consul.address,
        cfg.consul.token.clone(),
        cfg.consul.datacenter.clone(),
    );

    match discovery::ConsulRegistry::new(client, &args.listen, cfg.registration.clone()) {
        Ok(r) => {
            let r = Arc::new(r);
            if let Err(e) = r.register().await {
                tracing::error!("consul: initial registration failed: {}", e);
            }
            Some(r)
        }
        Err(e) => {
            tracing::error!("consul: failed to create registry: {}", e);
            None
        }
    }
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // Signal all background loops to stop.
    shutdown.notify_waiters();
}
