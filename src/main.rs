use std::sync::Arc;

use anyhow::Context;
use sluice::config::Config;
use sluice::handler::{Handler, Params, Router, StaticFiles};
use sluice::http::request::Request;
use sluice::http::response::Response;
use sluice::logging;
use sluice::server::Server;

fn health(_: &Request, _: &Params) -> Response {
    Response::ok("OK")
}

fn build_handler(cfg: &Config) -> anyhow::Result<Arc<dyn Handler>> {
    let mut router = Router::new().get("/health", health);
    if let Some(dir) = &cfg.server.directory {
        let files = StaticFiles::new(dir)
            .with_context(|| format!("Failed to open static directory {}", dir.display()))?;
        tracing::info!(root = %files.root().display(), "Serving static files");
        router = router.with_fallback(Arc::new(files));
    }
    Ok(Arc::new(router))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;
    cfg.validate()?;
    let _log_guard = logging::init(&cfg.logger)?;

    let server = Server::bind(&cfg.server, build_handler(&cfg)?)?;
    tracing::info!("Listening on {}", server.local_addr());
    let handle = server.handle();

    let mut reactor = tokio::task::spawn_blocking(move || server.run());

    tokio::select! {
        res = &mut reactor => {
            res??;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            handle.shutdown();
            reactor.await??;
        }
    }

    Ok(())
}
