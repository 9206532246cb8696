//! Fetch one origin path through the cache and print what came back.
//!
//! ```sh
//! cargo run --example fetch -- config.yml /content/site.css
//! ```
use anyhow::Context;
use shelter::config::AppConfig;
use shelter::{InboundRequest, ShelterContext, init_tracing};
use std::io::Write;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "config.yml".to_string());
    let path = args.next().unwrap_or_else(|| "/content/".to_string());

    let config = AppConfig::from_file(&config_path)
        .with_context(|| format!("loading {config_path}"))?;
    init_tracing(&config.settings.logging.filter);

    let ctx = ShelterContext::new(config)?;
    ctx.init().await;

    let inbound = InboundRequest::default();
    for attempt in 1..=2 {
        match ctx.serve_content(&path, &inbound, Some(0)).await {
            Some(response) => {
                tracing::info!(
                    attempt,
                    status = response.status(),
                    from_cache = response.cache.from_cache,
                    bytes = response.body().len(),
                    "fetched"
                );
                if attempt == 2 {
                    let body = response.into_body();
                    std::io::stdout()
                        .write_all(&body)
                        .context("writing body to stdout")?;
                }
            }
            None => tracing::warn!(attempt, %path, "nothing to serve"),
        }
    }
    Ok(())
}
