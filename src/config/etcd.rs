use crate::config::{EtcdConfig, RouteDefinition};
use crate::etcd::{
    EtcdClient,
    client::{
        b64_decode, b64_encode, prefix_range_end, RangeRequest, WatchCreate, WatchCreateRequest,
    },
};
use anyhow::Result;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Pure data types — no dependency on server::GatewayState.
// ---------------------------------------------------------------------------

/// A parsed configuration event from the etcd watch stream. Every PUT or
/// DELETE under the route prefix is treated identically: re-scan the whole
/// prefix and report the authoritative current route set, since a partial
/// delete-by-id would need the key's resource name to double as the route
/// id, which the wire schema (one JSON document per key, §6.2) does not
/// guarantee.
pub enum ConfigEvent {
    RoutesChanged(Vec<RouteDefinition>),
    MetaRevision(i64),
    /// A parse error was encountered (non-fatal, caller may count as metric).
    ParseError { key: String, error: String },
}

/// Result of initial config load from etcd.
pub struct InitialLoad {
    pub routes: Vec<RouteDefinition>,
    pub revision: i64,
    pub meta_revision: i64,
}

// ---------------------------------------------------------------------------
// Public API — stateless functions that only need EtcdClient + config.
// ---------------------------------------------------------------------------

pub struct EtcdPrefixes {
    pub route_prefix: String,
    pub meta_revision_key: String,
}

pub fn compute_prefixes(etcd_cfg: &EtcdConfig) -> EtcdPrefixes {
    let route_prefix = normalize_prefix(&etcd_cfg.route_prefix);
    let meta_key = format!(
        "{}/config_revision",
        etcd_cfg
            .meta_prefix
            .as_deref()
            .unwrap_or("/hermes/meta")
            .trim_end_matches('/')
    );
    EtcdPrefixes { route_prefix, meta_revision_key: meta_key }
}

/// Load all routes from etcd (range scan). Returns parsed data without
/// touching any shared state — the caller applies it.
pub async fn initial_load(client: &EtcdClient, prefixes: &EtcdPrefixes) -> Result<InitialLoad> {
    let (routes, revision) = scan_routes(client, &prefixes.route_prefix).await?;
    let meta_revision = read_meta_revision(client, &prefixes.meta_revision_key).await;

    info!(
        "etcd: initial load, routes={}, revision={}, meta_revision={}",
        routes.len(), revision, meta_revision
    );

    Ok(InitialLoad { routes, revision, meta_revision })
}

/// Open two concurrent watch streams (routes, meta) and yield `ConfigEvent`s
/// until either ends or errors. Returns the latest etcd revision observed,
/// so the caller can reconnect from there.
///
/// This function does NOT loop or reconnect — the caller owns the retry loop.
pub async fn watch_once(
    client: &EtcdClient,
    prefixes: &EtcdPrefixes,
    start_revision: i64,
    sender: tokio::sync::mpsc::UnboundedSender<ConfigEvent>,
) -> Result<i64> {
    let route_prefix = prefixes.route_prefix.clone();
    let meta_key = prefixes.meta_revision_key.clone();

    let client_r = client.clone();
    let client_m = client.clone();
    let sender_r = sender.clone();
    let sender_m = sender;

    let route_handle = tokio::spawn(async move {
        watch_route_stream(&client_r, &route_prefix, start_revision, sender_r).await
    });

    let meta_handle = tokio::spawn(async move {
        watch_meta_stream(&client_m, &meta_key, sender_m).await
    });

    tokio::select! {
        result = route_handle => {
            match result {
                Ok(Ok(rev)) => Ok(rev),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("route watch task panicked: {}", e)),
            }
        }
        result = meta_handle => {
            match result {
                Ok(Ok(rev)) => Ok(rev),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("meta watch task panicked: {}", e)),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn normalize_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

async fn scan_routes(client: &EtcdClient, prefix: &str) -> Result<(Vec<RouteDefinition>, i64)> {
    let key_b64 = b64_encode(prefix);
    let range_end = prefix_range_end(prefix);

    let resp = client
        .range(&RangeRequest {
            key: key_b64,
            range_end,
            keys_only: None,
        })
        .await?;

    let revision = resp.header.as_ref().and_then(|h| h.revision).unwrap_or(0);

    let mut routes = Vec::new();
    for kv in &resp.kvs {
        let key_str = match b64_decode(&kv.key) {
            Ok(k) => k,
            Err(_) => continue,
        };

        if key_str.contains("/history/") {
            continue;
        }

        if let Ok(value) = b64_decode(&kv.value) {
            match serde_json::from_str::<RouteDefinition>(&value) {
                Ok(route) => routes.push(route),
                Err(e) => {
                    warn!("etcd: initial route parse failed, key={}, error={}", key_str, e);
                }
            }
        }
    }

    info!("etcd: initial routes loaded, count={}, revision={}", routes.len(), revision);

    Ok((routes, revision))
}

/// Read the controlplane config revision from etcd meta key.
async fn read_meta_revision(client: &EtcdClient, key: &str) -> i64 {
    let resp = client
        .range(&RangeRequest {
            key: b64_encode(key),
            range_end: String::new(),
            keys_only: None,
        })
        .await;

    match resp {
        Ok(r) => {
            if let Some(kv) = r.kvs.first() {
                if let Ok(val_str) = b64_decode(&kv.value) {
                    val_str.trim().parse::<i64>().unwrap_or(0)
                } else {
                    0
                }
            } else {
                0
            }
        }
        Err(e) => {
            warn!("etcd: failed to read meta config_revision: {}", e);
            0
        }
    }
}

/// Watches the route prefix. On every event (PUT or DELETE, regardless of
/// which key changed) it re-scans the whole prefix and emits the full,
/// authoritative route set — see `ConfigEvent::RoutesChanged`.
async fn watch_route_stream(
    client: &EtcdClient,
    prefix: &str,
    start_revision: i64,
    sender: tokio::sync::mpsc::UnboundedSender<ConfigEvent>,
) -> Result<i64> {
    let key_b64 = b64_encode(prefix);
    let range_end = prefix_range_end(prefix);

    let mut stream = client
        .watch_stream(&WatchCreateRequest {
            create_request: WatchCreate {
                key: key_b64,
                range_end,
                start_revision: if start_revision > 0 { Some(start_revision + 1) } else { None },
            },
        })
        .await?;

    let mut latest_revision = start_revision;

    while let Some(watch_resp) = stream.next_response().await {
        let Some(result) = watch_resp.result else { continue };

        if let Some(header) = &result.header {
            if let Some(rev) = header.revision {
                latest_revision = rev;
            }
        }

        if result.events.is_empty() {
            continue;
        }

        for event in &result.events {
            if let Some(kv) = &event.kv {
                if let Ok(key_str) = b64_decode(&kv.key) {
                    let event_type = event.event_type.as_deref().unwrap_or("PUT");
                    info!("etcd: watch: route prefix changed, key={}, type={}, revision={}", key_str, event_type, latest_revision);
                }
            }
        }

        match scan_routes(client, prefix).await {
            Ok((routes, _)) => {
                let _ = sender.send(ConfigEvent::RoutesChanged(routes));
            }
            Err(e) => {
                error!("etcd: route re-scan after watch event failed, error={}", e);
                let _ = sender.send(ConfigEvent::ParseError {
                    key: prefix.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    Ok(latest_revision)
}

/// Watch the meta config_revision key and send MetaRevision events.
async fn watch_meta_stream(
    client: &EtcdClient,
    key: &str,
    sender: tokio::sync::mpsc::UnboundedSender<ConfigEvent>,
) -> Result<i64> {
    let key_b64 = b64_encode(key);

    let mut stream = client
        .watch_stream(&WatchCreateRequest {
            create_request: WatchCreate {
                key: key_b64,
                range_end: String::new(),
                start_revision: None,
            },
        })
        .await?;

    let mut latest_revision: i64 = 0;

    while let Some(watch_resp) = stream.next_response().await {
        if let Some(result) = watch_resp.result {
            if let Some(header) = &result.header {
                if let Some(rev) = header.revision {
                    latest_revision = rev;
                }
            }

            for event in &result.events {
                let event_type = event.event_type.as_deref().unwrap_or("PUT");
                if event_type == "PUT" {
                    if let Some(kv) = &event.kv {
                        if let Ok(val_str) = b64_decode(&kv.value) {
                            if let Ok(cp_rev) = val_str.trim().parse::<i64>() {
                                let _ = sender.send(ConfigEvent::MetaRevision(cp_rev));
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(latest_revision)
}
