use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use launchpad_admission::{tokens_from_env, EndpointState};
use launchpad_api::{BuildRequest, LaunchpadApi, Orchestrator, RunEvent, Settings};
use launchpad_kubehub::{ClusterApi, KubeCluster, MemoryCluster};
use launchpad_repo::{ProviderContext, ProviderRegistry};
use tokio::signal;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "launchpadctl", version, about = "Build repositories into images and launch them on a hub")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Use an in-process cluster instead of the current kube context
    #[arg(long = "in-memory", global = true, action = ArgAction::SetTrue)]
    in_memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build (if needed) and launch a repository, streaming progress
    Build {
        /// Provider prefix, e.g. gh, gl, git, zenodo
        provider: String,
        /// Provider spec, e.g. "org/repo/main"
        spec: String,
        /// Rate limit key of the caller
        #[arg(long = "client")]
        client: Option<String>,
        /// Skip the rate limit as a verified caller
        #[arg(long = "authenticated", action = ArgAction::SetTrue)]
        authenticated: bool,
        /// Launch as this hub user (implies --authenticated)
        #[arg(long = "user")]
        user: Option<String>,
        /// Terminate the build on Ctrl-C instead of leaving it running
        #[arg(long = "stop-on-interrupt", action = ArgAction::SetTrue)]
        stop_on_interrupt: bool,
    },
    /// Resolve a spec to its ref and derived build/image names
    Resolve { provider: String, spec: String },
    /// Serve the shared rate limit endpoint (tokens from RATE_LIMIT_TOKENS)
    ServeRatelimit {
        #[arg(long = "addr", default_value = "0.0.0.0:8787")]
        addr: SocketAddr,
    },
    /// Delete finished build pods and builds running longer than the max age
    GcBuilds {
        #[arg(long = "max-age-secs", default_value_t = 4 * 3600)]
        max_age_secs: u64,
    },
    /// Check that the registry and the hub are reachable
    Health,
}

fn init_tracing() {
    let env = std::env::var("LAUNCHPAD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LAUNCHPAD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid LAUNCHPAD_METRICS_ADDR; expected host:port");
        }
    }
}

async fn cluster(in_memory: bool) -> Result<Arc<dyn ClusterApi>> {
    if in_memory {
        info!("using in-memory cluster");
        return Ok(Arc::new(MemoryCluster::default()));
    }
    Ok(Arc::new(KubeCluster::try_default().await?))
}

async fn orchestrator(in_memory: bool) -> Result<Orchestrator> {
    let settings = Settings::from_env()?;
    let providers = ProviderRegistry::with_defaults(ProviderContext::from_env());
    Ok(Orchestrator::new(settings, cluster(in_memory).await?, providers)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { provider, spec, client, authenticated, user, stop_on_interrupt } => {
            let api = orchestrator(cli.in_memory).await?;
            let mut request = BuildRequest::new(&provider, &spec);
            if let Some(key) = client.as_deref() {
                request = request.with_client_key(key);
            }
            if authenticated || user.is_some() {
                request = request.authenticated_as(user.as_deref());
            }
            let mut run = api.build(request);
            let mut failed = false;
            loop {
                tokio::select! {
                    ev = run.rx.recv() => match ev {
                        Some(RunEvent::Heartbeat) => debug!("heartbeat"),
                        Some(RunEvent::Event(e)) => {
                            failed |= e.is_failed();
                            match cli.output {
                                Output::Human => print!("[{}] {}", e.phase, e.message.as_deref().unwrap_or("\n")),
                                Output::Json => println!("{}", serde_json::to_string(&e)?),
                            }
                            if e.is_terminal() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = signal::ctrl_c() => {
                        if stop_on_interrupt {
                            warn!("interrupted; stopping build");
                            run.stop();
                        } else {
                            warn!("interrupted; leaving build running");
                            run.cancel.cancel();
                            break;
                        }
                    }
                }
            }
            if failed {
                anyhow::bail!("{}/{} did not launch", provider, spec);
            }
        }
        Commands::Resolve { provider, spec } => {
            let api = orchestrator(cli.in_memory).await?;
            let r = LaunchpadApi::resolve(&api, &provider, &spec).await?;
            match cli.output {
                Output::Human => {
                    println!("repo:       {}", r.repo_url);
                    println!("ref:        {}", r.resolved_ref);
                    if let Some(url) = &r.ref_url {
                        println!("ref url:    {}", url);
                    }
                    println!("spec:       {}/{}", r.provider, r.resolved_spec);
                    println!("build slug: {}", r.build_slug);
                    println!("build name: {}", r.build_name);
                    println!("image:      {}", r.image_name);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&r)?),
            }
        }
        Commands::ServeRatelimit { addr } => {
            let settings = Settings::from_env()?;
            let state = EndpointState::with_default_limiters(
                tokens_from_env(),
                settings.rate_limit,
                settings.rate_limit_period,
                settings.rate_limit_clean,
            );
            let shutdown = async {
                let _ = signal::ctrl_c().await;
                info!("shutting down rate limiter");
            };
            launchpad_admission::serve(addr, state, shutdown).await.context("serving rate limit endpoint")?;
        }
        Commands::GcBuilds { max_age_secs } => {
            let api = orchestrator(cli.in_memory).await?;
            let removed = api.cleanup_builds(Duration::from_secs(max_age_secs)).await?;
            match cli.output {
                Output::Human => println!("removed {} build pod(s)", removed),
                Output::Json => println!("{}", serde_json::json!({ "removed": removed })),
            }
        }
        Commands::Health => {
            let api = orchestrator(cli.in_memory).await?;
            let report = LaunchpadApi::health(&api).await;
            match cli.output {
                Output::Human => {
                    for check in &report.checks {
                        println!("{:<16} {}", check.service, if check.ok { "ok" } else { "FAILING" });
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            if !report.ok {
                anyhow::bail!("unhealthy");
            }
        }
    }
    Ok(())
}
