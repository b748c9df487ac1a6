mod cache;
mod catalog;
mod config;
mod db;
mod entities;
mod error;
mod models;
mod resolver;
mod retry;
mod routes;
#[cfg(test)]
mod testing;

use std::{sync::Arc, time::Duration};

use crate::{
    cache::LinkCache,
    catalog::Catalog,
    config::Config,
    resolver::{HttpLinkResolver, LinkResolver},
    retry::RetryPolicy,
};

pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Catalog,
    pub cache: LinkCache,
    pub resolver: Arc<dyn LinkResolver>,
    pub retry: RetryPolicy,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,reelfetch=debug,sqlx=warn".to_string()),
        )
        .init();

    let config = Arc::new(Config::from_env()?);

    let http = wreq::Client::builder()
        .cookie_store(true)
        .redirect(wreq::redirect::Policy::none())
        .timeout(config.resolver_timeout())
        .build()?;

    let resolver: Arc<dyn LinkResolver> =
        Arc::new(HttpLinkResolver::new(http, &config.site_base_url, config.resolver_rps));

    let db = db::connect_and_migrate(&config.database_url).await?;
    let catalog = Catalog::new(db.clone());
    let cache = LinkCache::new(
        db,
        catalog.clone(),
        resolver.clone(),
        config.link_ttl_hours,
        config.resolver_timeout(),
    );
    cache.spawn_sweeper(config.sweep_interval());

    let retry = RetryPolicy::new(
        config.resolver_retry_attempts,
        Duration::from_millis(config.resolver_retry_delay_ms),
    );

    let state = Arc::new(AppState { config: config.clone(), catalog, cache, resolver, retry });
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    tracing::info!(addr = %config.addr, ttl_hours = config.link_ttl_hours, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
