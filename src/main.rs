//! engine-adapter: chat with any configured LLM engine from the command line.
//!
//! Builds one [`EngineAdapter`] from the configuration file, loads the
//! requested model (logging load progress) and runs a single chat turn,
//! printing streamed deltas to stdout as they arrive.

use std::io::Write;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use llm_engine_adapter::api::{ChatMessage, ChatOptions, UpdateCallback};
use llm_engine_adapter::config::{Cli, Config};
use llm_engine_adapter::{AdapterError, EngineAdapter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging. Logs go to stderr so stdout carries only the reply.
    let filter = if cli.verbose {
        "llm_engine_adapter=debug,engine_adapter=debug"
    } else {
        "llm_engine_adapter=info,engine_adapter=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    info!("engine-adapter v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;

    info!(
        backend = ?config.adapter.backend,
        provider = config.adapter.provider.id,
        model = config.generation.model,
        "Configuration loaded"
    );

    let adapter = EngineAdapter::from_config(&config).context("failed to build engine adapter")?;

    if cli.list_models {
        let models = adapter.models();
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }

    let Some(prompt) = cli.prompt else {
        bail!("nothing to do: pass --prompt or --list-models");
    };

    let model_config = config.model_config(cli.model.as_deref(), !cli.no_stream);

    // Load up front so progress lines go to the log rather than into the reply.
    let mut progress: UpdateCallback = Box::new(|text: &str, _: &str| info!("{text}"));
    adapter.init_model(&model_config, Some(&mut progress)).await?;

    let mut messages = Vec::new();
    if let Some(system) = cli.system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));

    let stream = model_config.stream;
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<Result<String, AdapterError>>();
    let finish_tx = outcome_tx.clone();

    let options = ChatOptions::new(model_config, messages, move |reply| {
        let _ = finish_tx.send(Ok(reply));
    })
    .on_update(|_, delta| {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(delta.as_bytes());
        let _ = stdout.flush();
    })
    .on_error(move |e| {
        let _ = outcome_tx.send(Err(e));
    });

    adapter.chat(options).await?;

    match outcome_rx.recv().await {
        Some(Ok(reply)) => {
            if stream {
                println!();
            } else {
                println!("{reply}");
            }
            Ok(())
        }
        Some(Err(e)) => {
            error!(error = %e, "Chat failed");
            Err(e.into())
        }
        None => bail!("chat ended without a reply"),
    }
}
