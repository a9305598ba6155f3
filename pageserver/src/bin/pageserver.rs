//! Main entry point for the Page Server executable.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing::*;
use utils::logging;

use pageserver::config::PageServerConf;
use pageserver::metrics::PrometheusTaskEvents;
use pageserver::task_mgr::BACKGROUND_RUNTIME;
use pageserver::{failpoint_support, TenantManager};

#[derive(Parser, Debug)]
#[command(about = "Keeps tenant timelines on local disk, with background GC and compaction", long_about = None)]
struct Args {
    /// Path to the working directory, containing pageserver.toml and the tenants.
    #[arg(short = 'D', long, default_value = ".neon")]
    workdir: Utf8PathBuf,
    /// Additional configuration overrides of the ones from the toml config file (or
    /// defaults if no config file is present), in `key=value` form.
    #[arg(short = 'c', long = "config-override")]
    config_override: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let workdir = args
        .workdir
        .canonicalize_utf8()
        .with_context(|| format!("Error opening workdir '{}'", args.workdir))?;

    let conf = PageServerConf::load(&workdir, &args.config_override)
        .context("Failed to parse pageserver configuration")?;
    // Tenants and their background loops refer to the config for the process lifetime.
    let conf: &'static PageServerConf = Box::leak(Box::new(conf));

    logging::init(conf.log_format, logging::Output::Stdout)?;
    logging::replace_panic_hook_with_tracing_panic_hook();
    info!(workdir = %conf.workdir, "starting pageserver");

    // Initialize up failpoints support
    let scenario = failpoint_support::init();

    let res = BACKGROUND_RUNTIME.block_on(run(conf));
    scenario.teardown();
    res
}

async fn run(conf: &'static PageServerConf) -> anyhow::Result<()> {
    let tenant_manager = TenantManager::new(
        conf,
        Arc::new(PrometheusTaskEvents),
        BACKGROUND_RUNTIME.handle().clone(),
    );
    tenant_manager
        .init_tenants()
        .await
        .context("Failed to load local tenants")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("Got shutdown signal, shutting down tenants");

    tenant_manager.shutdown_all_tenants().await;
    info!("Shut down successfully completed");
    Ok(())
}
