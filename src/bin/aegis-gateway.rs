use std::sync::Arc;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .ok_or("usage: aegis-gateway <config.json> [--listen HOST:PORT]")?;

    let mut listen: Option<String> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let raw = std::fs::read_to_string(&config_path)?;
    let config: aegis_gateway::GatewayConfig = serde_json::from_str(&raw)?;
    let listen = listen.unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    let sqlite = aegis_gateway::SqliteKeyStore::new(config.auth_db.path.clone());
    sqlite.init().await?;

    let redis_client = if config.redis.url.is_empty() {
        None
    } else {
        match redis::Client::open(config.redis.url.as_str()) {
            Ok(client) => Some(client),
            Err(err) => {
                tracing::warn!(error = %err, "invalid redis url; shared store disabled");
                None
            }
        }
    };
    let key_store = Arc::new(aegis_gateway::CachedKeyStore::new(
        redis_client,
        Arc::new(sqlite),
    ));

    let state = aegis_gateway::AppState::from_config(config, key_store);
    let app = aegis_gateway::router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(addr = %listen, version = env!("CARGO_PKG_VERSION"), "gateway starting");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
        })
        .await?;
    tracing::info!("gateway stopped");
    Ok(())
}
