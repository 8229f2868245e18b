mod bootstrap;
mod config;
mod server;

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use foreman_db::config::DbConfig;
use foreman_db::pool;

#[derive(Parser)]
#[command(name = "foreman", about = "Task-delegation daemon for coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon, serving JSON requests over stdio
    Serve,
    /// Write the default config file and initialize the database
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Show tasks from the store (omit task_id to list all)
    Status {
        /// Task id to show
        task_id: Option<String>,
    },
}

/// The cooperative single-threaded runtime keeps handler execution
/// serialized; only worker subprocesses run in parallel.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // All logging goes to stderr so stdout stays free for the wire
    // protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve => serve().await,
        Commands::Init { force } => init(force).await,
        Commands::Status { task_id } => status(task_id).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve() -> anyhow::Result<()> {
    let file_config = config::load_config().context("configuration invalid")?;
    let db_config = DbConfig::from_env().context("database location invalid")?;

    let db_pool = pool::create_pool(&db_config)
        .await
        .context("data directory inaccessible")?;
    pool::run_migrations(&db_pool)
        .await
        .context("migration failed")?;

    let daemon = bootstrap::build_daemon(&file_config, &db_config, db_pool).await?;

    // Reconcile persisted state before accepting any request.
    daemon
        .recovery
        .run()
        .await
        .context("startup recovery failed")?;
    let schedule_loop = daemon.schedule_engine.clone().start();

    info!(
        database = %db_config.database_path.display(),
        worker = %file_config.worker.program,
        max_workers = file_config.worker.max_workers,
        "foreman daemon ready"
    );

    let serve_result = tokio::select! {
        result = server::serve_stdio(daemon.manager.clone(), daemon.shutdown.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    };

    // Orderly shutdown: stop the schedule loop, then the workers.
    daemon.shutdown.cancel();
    let _ = schedule_loop.await;
    daemon
        .pool
        .kill_all("daemon shutdown")
        .await
        .ok();

    serve_result
}

async fn init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    config::save_config(&config::ConfigFile::default())?;
    println!("wrote config to {}", path.display());

    let db_config = DbConfig::from_env().context("database location invalid")?;
    let db_pool = pool::create_pool(&db_config)
        .await
        .context("data directory inaccessible")?;
    pool::run_migrations(&db_pool)
        .await
        .context("migration failed")?;
    println!("database ready at {}", db_config.database_path.display());
    Ok(())
}

async fn status(task_id: Option<String>) -> anyhow::Result<()> {
    let db_config = DbConfig::from_env().context("database location invalid")?;
    let db_pool = pool::create_pool(&db_config)
        .await
        .context("data directory inaccessible")?;
    pool::run_migrations(&db_pool)
        .await
        .context("migration failed")?;

    let tasks = foreman_db::repo::TaskRepository::new(db_pool);
    let rows = match task_id {
        Some(id) => match tasks.find_by_id(&id).await? {
            Some(task) => vec![task],
            None => anyhow::bail!("task {id} not found"),
        },
        None => tasks.find_all().await?,
    };

    if rows.is_empty() {
        println!("no tasks");
        return Ok(());
    }
    println!(
        "{:<38} {:<9} {:<8} {:<10} prompt",
        "id", "status", "priority", "exit"
    );
    for task in rows {
        let exit = task
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut prompt = task.prompt.replace('\n', " ");
        if prompt.len() > 60 {
            prompt.truncate(57);
            prompt.push_str("...");
        }
        println!(
            "{:<38} {:<9} {:<8} {:<10} {}",
            task.id, task.status, task.priority, exit, prompt
        );
    }
    Ok(())
}
