//! CLI for registry operations

use clap::{Parser, Subcommand};
use minirpc::common::path::{consumer_path, provider_path, service_path};
use minirpc::common::utils::local_ip;
use minirpc::common::{ApplicationConfig, CoordinatorConfig};
use minirpc::coord::MemoryTree;
use minirpc::registry::{ApplicationDescriptor, ReferenceDescriptor, ServiceDescriptor};
use minirpc::transport::loopback::{LoopbackNetwork, LoopbackServer, LoopbackTransport, ServiceImpl};
use minirpc::{ApplicationRegistrar, ConsumerRegistrar, ProviderRegistrar, RegistryConfig};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "minirpc")]
#[command(about = "minirpc service registry CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config and print the tree paths it would write
    Check {
        /// Config file
        #[arg(long)]
        config: PathBuf,
    },

    /// Run two providers and a consumer in-process
    Demo {
        /// Number of calls
        #[arg(long, default_value = "10")]
        calls: usize,
    },
}

/// `RUST_LOG` wins; otherwise `level`, falling back to `info` if it does not parse.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => {
            let cfg = RegistryConfig::load(&config)?;
            init_tracing(&cfg.log_level);
            check(&config, &cfg)?
        }
        Commands::Demo { calls } => {
            init_tracing("info");
            demo(calls).await?
        }
    }

    Ok(())
}

fn check(path: &Path, cfg: &RegistryConfig) -> anyhow::Result<()> {
    let app = ApplicationDescriptor::try_from(cfg.application.clone())?;
    let app_path = app.path(&cfg.coordinator.root);
    let host = local_ip().to_string();

    println!("Configuration OK: {}", path.display());
    println!("  Coordinator: {}", cfg.coordinator.servers);
    println!(
        "  Session:     timeout {}ms, call timeout {}ms, {} retries every {}ms",
        cfg.coordinator.session_timeout_ms,
        cfg.coordinator.connection_timeout_ms,
        cfg.coordinator.retry_times,
        cfg.coordinator.retry_interval_ms
    );
    println!("  Application: {}", app_path);

    for svc in &cfg.services {
        let descriptor = ServiceDescriptor::try_from(svc)?.with_host(&host);
        let base = service_path(&app_path, &svc.protocol, &svc.interface, &svc.version);
        println!("  Provider:    {}", provider_path(&base, &descriptor.node()));
    }
    for reference in &cfg.references {
        ReferenceDescriptor::try_from(reference)?;
        let base = service_path(
            &app_path,
            &reference.protocol,
            &reference.interface,
            &reference.version,
        );
        println!("  Consumer:    {}", consumer_path(&base, &host));
    }
    if let Some(monitor) = &cfg.monitor {
        let schedule = monitor.schedule()?;
        println!("  Monitor:     sync every {:?}", schedule.sync.1);
    }
    Ok(())
}

async fn demo(calls: usize) -> anyhow::Result<()> {
    let tree = MemoryTree::new();
    let network = LoopbackNetwork::new();
    let identity = ApplicationConfig::new("greeter", "demo", "ops", "dev");
    let coordinator = CoordinatorConfig::default();

    let mut providers = Vec::new();
    for host in ["10.0.0.1", "10.0.0.2"] {
        let app = ApplicationRegistrar::builder(identity.clone())
            .coordinator(coordinator.clone())
            .client(Arc::new(tree.session()))
            .host(host)
            .build()?;
        let greeting = format!("hello from {}", host);
        let server = Arc::new(LoopbackServer::new(Arc::clone(&network)).implement(
            "Greeter",
            ServiceImpl::new().method("greet", move |args| {
                let name = args.first().and_then(Value::as_str).unwrap_or("stranger");
                Ok(json!(format!("{}, {}", greeting, name)))
            }),
        ));
        let provider = ProviderRegistrar::new(
            &app,
            "loopback",
            9100,
            server,
            vec![ServiceDescriptor::new("loopback", "Greeter", "1.0", 9100)],
        )?;
        provider.register().await?;
        providers.push(app);
    }

    let app = ApplicationRegistrar::builder(identity)
        .coordinator(coordinator)
        .client(Arc::new(tree.session()))
        .host("10.0.0.9")
        .build()?;
    let consumer = ConsumerRegistrar::builder(
        "loopback",
        Arc::new(LoopbackTransport::new(Arc::clone(&network))),
    )
    .references(vec![ReferenceDescriptor::new("loopback", "Greeter", "1.0")])
    .build(&app)?;
    consumer.discovery().await?;

    let stub = consumer.stub("Greeter")?;
    for i in 0..calls {
        let reply: String = stub.call("greet", vec![json!(format!("caller-{}", i))]).await?;
        println!("{}", reply);
    }

    println!("Served:");
    for address in ["10.0.0.1:9100", "10.0.0.2:9100"] {
        println!("  {}: {}", address, network.served(address));
    }

    app.unregister().await?;
    for provider_app in providers {
        provider_app.unregister().await?;
    }
    Ok(())
}
