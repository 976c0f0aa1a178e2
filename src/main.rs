use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vigil::broadcast::EventHub;
use vigil::config::Config;
use vigil::context::ContextManager;
use vigil::fsm::executor::Coordinator;
use vigil::fsm::{self, AgentEvent, Delay, FsmContext, Mode};
use vigil::gateway::{self, GatewayState};
use vigil::model::HttpModelClient;
use vigil::prompt;
use vigil::store::Store;
use vigil::tools;

#[derive(Debug, Parser)]
#[command(name = "vigil", about = "Perpetual agent harness")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the gateway port.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.listen_port = port;
    }

    std::fs::create_dir_all(&config.workspace_path)?;
    let store = Arc::new(Store::open(&config.store_path())?);
    let session = store.ensure_open_session()?;
    tracing::info!(session = session.id, "store ready at {}", config.store_path().display());

    let mode = store
        .get_state("mode", serde_json::json!("conversational"))?
        .as_str()
        .and_then(Mode::parse)
        .unwrap_or(Mode::Conversational);
    let delay = Delay::from_json(&store.get_state("delay", serde_json::json!(30))?)
        .unwrap_or(Delay::Seconds(30));

    let system_prompt = prompt::system_prompt(&config);
    let autonomous_prompt = prompt::autonomous_prompt(&config);

    let mut ctx = FsmContext::new(
        system_prompt.clone(),
        autonomous_prompt,
        mode,
        delay,
        session.handoff_summary.as_deref(),
    );

    // Restore the current session's conversation horizon from the log.
    let horizon: Vec<_> = store
        .list_messages()?
        .into_iter()
        .filter(|m| m.timestamp >= session.started_at)
        .collect();
    if !horizon.is_empty() {
        ctx.window = fsm::window_from_log(
            &system_prompt,
            session.handoff_summary.as_deref(),
            &horizon,
        );
        tracing::info!("restored {} window messages from the log", ctx.window.len());
    }

    let hub = EventHub::new();
    let model = Arc::new(HttpModelClient::new(
        config.model.endpoint.clone(),
        config.model.name.clone(),
    ));
    let registry = Arc::new(tools::builtin_registry(&config));

    let (coordinator, handle) = Coordinator::new(
        ctx,
        Arc::clone(&store),
        hub.clone(),
        model,
        registry,
        ContextManager::new(config.context_size),
        config.workspace_path.clone(),
    );
    let coordinator_task = tokio::spawn(coordinator.run());

    if mode == Mode::Autonomous {
        handle.send(AgentEvent::AutonomousTick).await;
    }

    let gateway_state = Arc::new(GatewayState { handle, store, hub });
    tokio::select! {
        result = gateway::serve(gateway_state, config.listen_port) => {
            result?;
        }
        _ = coordinator_task => {
            anyhow::bail!("coordinator stopped; see log for the store failure");
        }
    }
    Ok(())
}
