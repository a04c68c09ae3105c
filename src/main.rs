//! query-pipeline - command-line runner.
//!
//! Connects every configured database, builds the middleware pipeline and
//! runs one SQL query or statement through it.

use clap::Parser;
use query_pipeline::config::Config;
use query_pipeline::middleware::{IsolationMiddleware, ReplicaMiddleware, TimeoutMiddleware};
use query_pipeline::models::{Isolation, Replica, Target};
use query_pipeline::{AdapterRegistry, Executor, Options, Pipeline, SqlxAdapter};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn usage() {
    eprintln!("Error: At least one database and an SQL string must be given.");
    eprintln!();
    eprintln!("Usage: query-pipeline --database <id>=<connection_string> <SQL>");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  query-pipeline -d sqlite:data.db \"SELECT * FROM users\"");
    eprintln!("  query-pipeline -d app=sqlite:app.db?writable=true -x \"DELETE FROM jobs\"");
    eprintln!(
        "  query-pipeline -d main=postgres://u:p@db/app,ro=postgres://u:p@replica/app \\"
    );
    eprintln!("      --replica main=ro --read-replica \"SELECT count(*) FROM orders\"");
}

async fn build_registry(config: &Config) -> Result<AdapterRegistry, Box<dyn std::error::Error>> {
    let databases = config.parse_databases()?;
    let default = config.default_connection_id(&databases)?;
    info!(count = databases.len(), default = %default, "Connecting to databases");

    let mut registry = AdapterRegistry::new(default);
    for database in &databases {
        let connection = database.to_connection_config()?;
        let adapter = SqlxAdapter::connect(&connection).await?;
        registry.register(database.id.clone(), Arc::new(adapter))?;
    }
    Ok(registry)
}

fn build_pipeline(
    config: &Config,
    registry: &Arc<AdapterRegistry>,
) -> Result<Pipeline, Box<dyn std::error::Error>> {
    let mut replicas = ReplicaMiddleware::new().fallback(config.fallback);
    for (primary, names) in config.replica_map()? {
        for name in &names {
            if !registry.contains(name) {
                return Err(format!("Replica '{name}' of '{primary}' is not configured").into());
            }
        }
        replicas = replicas.replicas(primary, names);
    }
    if config.disable_replicas {
        replicas.disable();
    }

    let timeout = match config.query_timeout_duration() {
        Some(limit) => TimeoutMiddleware::with_default(limit),
        None => TimeoutMiddleware::new(),
    };

    Ok(Pipeline::new()
        .layer(timeout)
        .query(replicas)
        .layer(IsolationMiddleware::new(Arc::clone(registry))))
}

async fn run(config: &Config, sql: &str, executor: &Executor) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = Options::new();
    if let Some(connection) = &config.connection {
        options.push(Target::new(connection.clone()));
    }
    if let Some(level) = config.isolation {
        options.push(Isolation::new(level));
    }

    if config.execute {
        let affected = executor.statement(sql, options).await?;
        println!("{affected}");
    } else {
        if config.read_replica {
            options.push(Replica::new());
        }
        let result = executor.query(sql, options).await?;
        println!("{}", serde_json::to_string_pretty(&result.externalize()?)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let Some(sql) = config.sql.clone().filter(|_| !config.databases.is_empty()) else {
        usage();
        std::process::exit(1);
    };

    let registry = Arc::new(build_registry(&config).await?);
    let pipeline = build_pipeline(&config, &registry)?;
    let executor = Executor::new(Arc::clone(&registry), pipeline);

    let result = run(&config, &sql, &executor).await;
    registry.close_all().await;

    if let Err(e) = result {
        error!(error = %e, "Run failed");
        return Err(e);
    }
    Ok(())
}
