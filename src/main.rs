use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use deepharvest::cli::{Cli, Commands};
use deepharvest::config::CrawlConfig;
use deepharvest::error::CrawlError;
use deepharvest::orchestration::{build_crawler, setup_shutdown_handler};
use deepharvest::plugins::{CapabilityKind, PluginRequest};

/// Load config from `--config`, then `DEEPHARVEST_CONFIG`, then defaults.
fn load_config(cli_path: Option<&str>) -> Result<CrawlConfig, CrawlError> {
    let path = cli_path
        .map(String::from)
        .or_else(|| std::env::var("DEEPHARVEST_CONFIG").ok());

    match path {
        Some(path) => CrawlConfig::load(Path::new(&path)),
        None => Ok(CrawlConfig::default()),
    }
}

fn exit_code_for(error: &CrawlError) -> ExitCode {
    match error {
        CrawlError::Config(_) => ExitCode::from(1),
        _ => ExitCode::from(2),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let result = match cli.command {
        Commands::Crawl {
            urls,
            depth,
            js,
            output,
            config,
            distributed,
            redis_url,
            workers,
        } => {
            run_crawl(
                urls, depth, js, output, config, distributed, redis_url, workers, None,
            )
            .await
        }
        Commands::Resume {
            state_file,
            config,
            output,
        } => run_resume(state_file, config, output).await,
        Commands::Osint {
            url,
            json,
            graph,
            screenshot,
            output,
        } => run_osint(url, json, graph, screenshot, output).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            exit_code_for(&e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_crawl(
    urls: Vec<String>,
    depth: Option<u32>,
    js: bool,
    output: Option<String>,
    config_path: Option<String>,
    distributed: bool,
    redis_url: Option<String>,
    workers: Option<usize>,
    resume_from: Option<String>,
) -> Result<(), CrawlError> {
    let mut config = load_config(config_path.as_deref())?;

    // CLI flags override the config file.
    if !urls.is_empty() {
        config.seed_urls = urls;
    }
    if let Some(depth) = depth {
        config.max_depth = Some(depth);
    }
    if js {
        config.enable_js = true;
    }
    if let Some(output) = output {
        config.output_dir = output;
    }
    if distributed {
        config.distributed = true;
    }
    if let Some(redis_url) = redis_url {
        config.redis_url = Some(redis_url);
    }
    if let Some(workers) = workers {
        config.concurrent_requests = workers;
    }

    deepharvest::logging::init_logging(&config.output_dir)
        .map_err(|e| CrawlError::Config(format!("logging: {}", e)))?;

    let crawler = Arc::new(build_crawler(config, None).await?);
    setup_shutdown_handler(crawler.cancel.clone());

    if let Some(state_file) = resume_from {
        crawler.restore_checkpoint(Path::new(&state_file)).await?;
    }

    let seeded = crawler.admit_seeds().await?;
    tracing::info!(seeded, "seeds admitted");

    let report = crawler.run().await?;
    crawler.print_summary(&report);
    Ok(())
}

async fn run_resume(
    state_file: String,
    config_path: Option<String>,
    output: Option<String>,
) -> Result<(), CrawlError> {
    if !Path::new(&state_file).exists() {
        return Err(CrawlError::Config(format!(
            "state file not found: {}",
            state_file
        )));
    }
    run_crawl(
        Vec::new(),
        None,
        false,
        output,
        config_path,
        false,
        None,
        None,
        Some(state_file),
    )
    .await
}

async fn run_osint(
    url: String,
    json: bool,
    graph: bool,
    screenshot: bool,
    output: Option<String>,
) -> Result<(), CrawlError> {
    let config = CrawlConfig {
        output_dir: output.unwrap_or_else(|| "./osint_output".to_string()),
        ..CrawlConfig::default()
    };
    deepharvest::logging::init_logging(&config.output_dir)
        .map_err(|e| CrawlError::Config(format!("logging: {}", e)))?;

    let crawler = Arc::new(build_crawler(config, None).await?);

    // OSINT collection is a collaborator concern; the core only routes.
    let Some(plugin) = crawler
        .plugins
        .with_capability(CapabilityKind::Fetch)
        .into_iter()
        .find(|p| p.name() == "osint")
    else {
        return Err(CrawlError::Config(
            "no OSINT collaborator registered; install one via the plugin loader".into(),
        ));
    };

    let response = plugin.invoke(PluginRequest::Fetch { url: &url }).await?;
    let deepharvest::plugins::PluginResponse::Fetched(fetch) = response else {
        return Err(CrawlError::Config("osint plugin returned wrong response".into()));
    };

    tracing::info!(
        url = %url,
        status = fetch.status,
        json,
        graph,
        screenshot = screenshot && fetch.screenshot.is_some(),
        "osint collection finished"
    );
    Ok(())
}
