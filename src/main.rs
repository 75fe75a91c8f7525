use gossip_events::cluster::Cluster;
use gossip_events::config::ClusterConfig;
use gossip_events::coordinate::CoordinateClient;
use gossip_events::coordinate::ping::CoordinateDelegate;
use gossip_events::event::types::Event;
use gossip_events::membership::service::MembershipService;
use gossip_events::membership::transport::PingDelegate;
use gossip_events::message::types::QueryParam;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>] [--name <name>] [--tag key=value]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:7946", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:7947 --seed 127.0.0.1:7946 --tag role=web",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut config = ClusterConfig::default();
    let mut tags = HashMap::new();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind", Some(v)) => {
                bind_addr = Some(v.parse()?);
                i += 2;
            }
            ("--seed", Some(v)) => {
                seed_nodes.push(v.parse()?);
                i += 2;
            }
            ("--name", Some(v)) => {
                config.node_name = v.clone();
                i += 2;
            }
            ("--tag", Some(v)) => {
                if let Some((key, val)) = v.split_once('=') {
                    tags.insert(key.to_string(), val.to_string());
                }
                i += 2;
            }
            ("--no-coordinates", _) => {
                config.coordinates_enabled = false;
                i += 1;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.ok_or_else(|| anyhow::anyhow!("--bind is required"))?;

    tracing::info!("Starting node {} on {}", config.node_name, bind_addr);
    if !seed_nodes.is_empty() {
        tracing::info!("Seed nodes: {:?}", seed_nodes);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Coordinates (fed by membership probes):
    let coordinates = Arc::new(CoordinateClient::new(config.coordinate.clone()));
    let delegate: Arc<dyn PingDelegate> = Arc::new(CoordinateDelegate::new(
        coordinates.clone(),
        config.coordinates_enabled,
    ));

    // 2. Membership (UDP gossip):
    let (membership, transport_events) = MembershipService::new(
        config.node_name.clone(),
        bind_addr,
        seed_nodes,
        tags,
        Some(delegate),
    )
    .await?;

    // 3. Event and query layer:
    let coordinates = config.coordinates_enabled.then_some(coordinates);
    let (cluster, mut events) = Cluster::new(config, membership.clone(), coordinates);
    cluster.start(transport_events);

    membership.clone().start().await;

    // 4. Spawn application event handler:
    let handler = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::Query(query) if query.name == "ping" => {
                    if let Err(e) = query.respond(b"pong".to_vec()).await {
                        tracing::warn!("Failed to answer ping from {}: {}", query.source_node(), e);
                    }
                }
                other => tracing::info!("Event: {}", other),
            }
        }
    });

    // 5. Spawn stats reporter:
    let stats_cluster = cluster.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let members = stats_cluster.members();
            tracing::info!("Cluster stats: {} alive nodes", stats_cluster.num_members());
            for member in members {
                let rtt = stats_cluster.estimate_rtt(&member.name);
                tracing::info!(
                    "  - {} at {} status={:?} rtt={:?}",
                    member.name,
                    member.socket_addr(),
                    member.status,
                    rtt
                );
            }
            if let Some(coord) = stats_cluster.coordinate() {
                tracing::info!("Local coordinate error: {:.3}", coord.error);
            }
        }
    });

    // 6. Spawn periodic ping query:
    let query_cluster = cluster.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));

        loop {
            interval.tick().await;
            let params = QueryParam {
                request_ack: true,
                ..query_cluster.default_query_params()
            };
            match query_cluster.query("ping", Vec::new(), params).await {
                Ok(mut resp) => {
                    let responses = resp.collect().await;
                    let summary = resp.summary();
                    tracing::info!(
                        "Ping query {}: {} responses, {} acks",
                        resp.id(),
                        responses.len(),
                        summary.acks
                    );
                }
                Err(e) => tracing::warn!("Ping query failed: {}", e),
            }
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    membership.leave().await;
    cluster.shutdown().await;
    membership.stop();
    handler.abort();

    Ok(())
}
