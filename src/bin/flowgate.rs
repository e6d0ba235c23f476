//! flowgate CLI: operator interface to the dispatcher and workitem queues.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use flowgate::auth::{IdentityResolver, JwtIdentityResolver};
use flowgate::config::Config;
use flowgate::db::Db;
use flowgate::dispatch::{Backends, Connection, Dispatcher, Envelope, OffloadWorker};
use flowgate::model::Identity;
use flowgate::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use serde_json::{Value, json};

#[derive(Parser)]
#[command(name = "flowgate", about = "Workflow command dispatcher and workitem queues")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the offload worker and log queue wake-ups until interrupted
    Serve {
        /// Use in-memory backends even when DATABASE_URL is set
        #[arg(long)]
        in_memory: bool,
    },
    /// Mint a signed bearer token for development
    Token {
        /// User id (24 hex characters)
        user_id: String,
        /// Username
        username: String,
        /// Display name, defaults to the username
        #[arg(long)]
        name: Option<String>,
        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
    },
    /// Workitem queue operations, run through the dispatcher
    Wiq {
        /// Act as this user id
        #[arg(long = "as", global = true)]
        user_id: Option<String>,
        /// Username for --as
        #[arg(long, global = true)]
        username: Option<String>,
        #[command(subcommand)]
        action: WiqAction,
    },
}

#[derive(Subcommand)]
enum WiqAction {
    /// Create a workitem queue
    AddQueue {
        name: String,
        #[arg(long, default_value_t = 3)]
        maxretries: u32,
        /// Seconds before a retried item is due again
        #[arg(long, default_value_t = 0)]
        retrydelay: u64,
        /// Seconds before a new item is due
        #[arg(long, default_value_t = 0)]
        initialdelay: u64,
        #[arg(long)]
        success_wiq: Option<String>,
        #[arg(long)]
        failed_wiq: Option<String>,
    },
    /// Add a workitem
    Add {
        wiq: String,
        #[arg(long)]
        name: Option<String>,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        #[arg(long)]
        priority: Option<i64>,
    },
    /// Claim the next due workitem
    Pop { wiq: String },
    /// Set a workitem's state
    Update {
        id: String,
        state: String,
        #[arg(long)]
        errormessage: Option<String>,
        #[arg(long)]
        errortype: Option<String>,
    },
    /// Show a workitem queue
    Show { wiq: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { in_memory } => cmd_serve(in_memory).await,
        Command::Token {
            user_id,
            username,
            name,
            ttl,
        } => cmd_token(user_id, username, name, ttl),
        Command::Wiq {
            user_id,
            username,
            action,
        } => cmd_wiq(user_id, username, action).await,
    }
}

async fn connect(config: &Config) -> anyhow::Result<Backends> {
    let db = Db::connect(config.require_database_url()?.expose_secret()).await?;
    db.migrate().await?;
    Ok(db.into_backends())
}

async fn cmd_serve(in_memory: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "flowgate"))?;

    let backends = if in_memory || config.database_url.is_none() {
        tracing::warn!("running with in-memory backends, nothing will be persisted");
        Backends::in_memory()
    } else {
        connect(&config).await?
    };
    let resolver = Arc::new(JwtIdentityResolver::new(
        &config.signing_key,
        backends.store.clone(),
        config.policy.max_role_depth,
    ));
    let dispatcher = Arc::new(Dispatcher::build(&backends, resolver, config.policy.clone()));

    let mut wakeups = dispatcher.engine().monitor().subscribe();
    tokio::spawn(async move {
        while let Ok(wiqid) = wakeups.recv().await {
            tracing::info!(wiqid = %wiqid, "queue has due work");
        }
    });

    let worker = OffloadWorker::new(dispatcher.clone(), backends.bus.clone(), &config.policy.offload);
    let w = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
    });

    if config.policy.offload.enabled {
        worker.run().await?;
    } else {
        tracing::info!("offload disabled, waiting for interrupt");
        tokio::signal::ctrl_c().await.ok();
    }
    Ok(())
}

fn cmd_token(user_id: String, username: String, name: Option<String>, ttl: u64) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let resolver = JwtIdentityResolver::new(
        &config.signing_key,
        Backends::in_memory().store,
        config.policy.max_role_depth,
    );
    let identity = Identity::new(user_id, name.unwrap_or_else(|| username.clone()), username);
    let token = resolver.issue(&identity, std::time::Duration::from_secs(ttl))?;
    println!("{token}");
    Ok(())
}

async fn cmd_wiq(user_id: Option<String>, username: Option<String>, action: WiqAction) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let backends = connect(&config).await?;
    let resolver = Arc::new(JwtIdentityResolver::new(
        &config.signing_key,
        backends.store.clone(),
        config.policy.max_role_depth,
    ));

    let identity = match (user_id, username) {
        (Some(id), Some(username)) => Identity::new(id, username.clone(), username),
        (Some(id), None) => Identity::new(id.clone(), id.clone(), id),
        _ => Identity::root(),
    };
    let jwt = resolver.issue(&identity, config.policy.token_ttl())?;
    let dispatcher = Dispatcher::build(&backends, resolver, config.policy.clone());

    let (command, data) = match action {
        WiqAction::AddQueue {
            name,
            maxretries,
            retrydelay,
            initialdelay,
            success_wiq,
            failed_wiq,
        } => (
            "addworkitemqueue",
            json!({
                "name": name,
                "maxretries": maxretries,
                "retrydelay": retrydelay,
                "initialdelay": initialdelay,
                "success_wiq": success_wiq,
                "failed_wiq": failed_wiq,
            }),
        ),
        WiqAction::Add {
            wiq,
            name,
            payload,
            priority,
        } => {
            let payload: Option<Value> = payload.map(|p| serde_json::from_str(&p)).transpose()?;
            (
                "addworkitem",
                json!({ "wiq": wiq, "name": name, "payload": payload, "priority": priority }),
            )
        }
        WiqAction::Pop { wiq } => ("popworkitem", json!({ "wiq": wiq })),
        WiqAction::Update {
            id,
            state,
            errormessage,
            errortype,
        } => (
            "updateworkitem",
            json!({ "_id": id, "state": state, "errormessage": errormessage, "errortype": errortype }),
        ),
        WiqAction::Show { wiq } => ("getworkitemqueue", json!({ "name": wiq })),
    };

    let envelope = Envelope::request(command, data).with_jwt(jwt);
    let reply = dispatcher
        .process_local(&mut Connection::unlimited(), envelope)
        .await;
    if let Some(message) = reply.error_message() {
        anyhow::bail!("{command} failed: {message}");
    }
    println!("{}", serde_json::to_string_pretty(&reply.data)?);
    Ok(())
}
