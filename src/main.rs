//! Tether CLI - subscribe, publish and query history from the command line.
//!
//! Credentials come from `TETHER_*` environment variables, optionally on top
//! of a JSON options file passed with `--config`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tether::{ClientOptions, Data, HistoryParams, Message, Realtime, Rest};

#[derive(Parser)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Realtime publish/subscribe client")]
struct Cli {
    /// JSON options file. Environment variables override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print messages published on a channel until interrupted
    Subscribe {
        channel: String,
        /// Only messages with this name
        #[arg(long)]
        name: Option<String>,
    },
    /// Publish one message and wait for the acknowledgement
    Publish {
        channel: String,
        name: String,
        /// Body; parsed as JSON when it is valid JSON
        data: Option<String>,
    },
    /// Print recent messages from a channel's history
    History {
        channel: String,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

fn load_options(path: Option<&PathBuf>) -> Result<ClientOptions> {
    let mut options = match path {
        Some(path) => ClientOptions::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientOptions::default(),
    };
    options.apply_env_overrides();
    Ok(options)
}

fn parse_data(raw: Option<String>) -> Data {
    match raw {
        None => Data::Null,
        Some(text) => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) if value.is_object() || value.is_array() => Data::Json(value),
            _ => Data::String(text),
        },
    }
}

fn print_message(message: &Message) {
    let name = message.name.as_deref().unwrap_or("-");
    let client = message.client_id.as_deref().unwrap_or("-");
    let data = match &message.data {
        Data::Null => String::new(),
        Data::String(s) => s.clone(),
        Data::Binary(b) => format!("<{} bytes>", b.len()),
        Data::Json(v) => v.to_string(),
    };
    println!("[{}] {} {}: {}", message.timestamp.unwrap_or_default(), client, name, data);
}

async fn subscribe(options: ClientOptions, channel: &str, name: Option<String>) -> Result<()> {
    let client = Realtime::new(options)?;
    let channel = client.channels().get(channel);
    match name {
        Some(name) => channel.subscribe_to(&name, print_message).await?,
        None => channel.subscribe(print_message).await?,
    };
    log::info!("Subscribed to '{}', press Ctrl-C to stop", channel.name());

    tokio::signal::ctrl_c().await?;
    client.close().await?;
    Ok(())
}

async fn publish(options: ClientOptions, channel: &str, name: String, data: Option<String>) -> Result<()> {
    let client = Realtime::new(options)?;
    client
        .channels()
        .get(channel)
        .publish(Message::new(name, parse_data(data)))
        .await
        .context("publish failed")?;
    println!("Published to '{}'", channel);
    client.close().await?;
    Ok(())
}

async fn history(options: ClientOptions, channel: &str, limit: u32) -> Result<()> {
    let rest = Rest::new(&options)?;
    let params = HistoryParams {
        limit,
        ..HistoryParams::default()
    };
    for message in rest.channel(channel).history(params).await? {
        print_message(&message);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let options = load_options(cli.config.as_ref())?;

    match cli.command {
        Commands::Subscribe { channel, name } => subscribe(options, &channel, name).await,
        Commands::Publish {
            channel,
            name,
            data,
        } => publish(options, &channel, name, data).await,
        Commands::History { channel, limit } => history(options, &channel, limit).await,
    }
}
