// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use quadstore::{QuadConnection, QuadStore, StoreConfig, StoreError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quadstore=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match StoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = inspect(config) {
        tracing::error!("Failed to inspect store: {e}");
        std::process::exit(1);
    }
}

/// Open the store, log what it holds and close it again.
fn inspect(config: StoreConfig) -> Result<(), StoreError> {
    let store = QuadStore::open(config)?;
    let stats = store.stats()?;
    tracing::info!(
        generation = stats.pager.generation,
        quads = stats.quads,
        terms = stats.dictionary.terms,
        "store contents"
    );
    tracing::info!(
        total_pages = stats.pager.total_pages,
        free_pages = stats.pager.free_pages,
        pending_pages = stats.pending_pages,
        "page file"
    );
    tracing::info!(
        cached = stats.cache.cached,
        hits = stats.cache.hits,
        misses = stats.cache.misses,
        "node cache"
    );

    let mut conn = store.connection()?;
    let explicit = conn.size(&[])?;
    let contexts = conn.context_ids()?.collect_all()?;
    tracing::info!(
        explicit,
        inferred = stats.quads.saturating_sub(explicit),
        contexts = contexts.len(),
        "statements"
    );
    for (prefix, name) in conn.namespaces()? {
        tracing::info!("namespace {prefix}: <{name}>");
    }
    conn.close()?;
    store.close()
}
