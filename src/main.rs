use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use storedesk::api::{endpoints, ApiClient, Page};
use storedesk::config::{self, Config};
use storedesk::event::{Event, EventHandler};
use storedesk::session::{FileSession, MemorySession, SessionStore};
use storedesk::store::Dispatcher;

#[derive(Parser, Debug)]
#[command(name = "storedesk")]
#[command(about = "Query the storedesk back-office API through its cached dispatcher")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storedesk/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a resource collection and print the stored payload
  Get {
    /// Resource name or alias (see `storedesk endpoints`)
    resource: String,
    /// Parent id for scoped resources (e.g. a vehicle for vehicule_depenses)
    #[arg(long)]
    id: Option<String>,
    #[arg(short, long)]
    page: Option<u64>,
    /// Extra query parameter, repeatable
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    params: Vec<(String, String)>,
  },
  /// Store a bearer token for later requests
  Login { token: String },
  /// Forget the stored token
  Logout,
  /// List known resources and their endpoints
  Endpoints,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
  let (key, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
  if key.is_empty() {
    return Err(format!("empty key in '{}'", s));
  }
  Ok((key.to_string(), value.to_string()))
}

/// Log to a daily file in the data directory; stdout carries command output.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "storedesk.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_env("STOREDESK_LOG").unwrap_or_else(|_| EnvFilter::new("storedesk=info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  match args.command {
    Command::Endpoints => {
      for resource in endpoints::RESOURCES {
        println!(
          "{:<20} {:<32} {}",
          resource.name, resource.path, resource.description
        );
      }
      Ok(())
    }
    Command::Login { token } => {
      let session = FileSession::open()?;
      session.set_token(&token)?;
      eprintln!("Token saved to {}", session.path().display());
      Ok(())
    }
    Command::Logout => {
      FileSession::open()?.clear()?;
      eprintln!("Logged out");
      Ok(())
    }
    Command::Get {
      resource,
      id,
      page,
      params,
    } => {
      let config = Config::load(args.config.as_deref())?;
      get(&config, &resource, id.as_deref(), page, params).await
    }
  }
}

async fn get(
  config: &Config,
  name: &str,
  id: Option<&str>,
  page: Option<u64>,
  params: Vec<(String, String)>,
) -> Result<()> {
  let resource =
    endpoints::lookup(name).ok_or_else(|| eyre!("Unknown resource '{}'. Try `storedesk endpoints`.", name))?;

  let mut request = resource
    .request(id)
    .ok_or_else(|| eyre!("Resource '{}' needs a valid --id", resource.name))?;
  if let Some(page) = page {
    request = request.param("page", page);
  }
  for (key, value) in params {
    request = request.param(key, value);
  }

  // Environment token wins over the persisted one and is never written back
  let session: Arc<dyn SessionStore> = match Config::env_token() {
    Some(token) => Arc::new(MemorySession::with_token(token)),
    None => Arc::new(FileSession::open()?),
  };

  let mut events = EventHandler::new();
  let client = ApiClient::new(&config.api, session)?.with_events(events.sender());
  let dispatcher = Dispatcher::new(client, config.store.resolve_policy);
  events.forward_store(dispatcher.subscribe());

  let key = request.item_key.clone();
  let result = dispatcher.dispatch(request).await;

  while let Some(event) = events.try_next() {
    match event {
      Event::LoginRequired { route } => {
        eprintln!(
          "Session expired (login route {}). Run `storedesk login <token>`.",
          route
        );
      }
      Event::Store(event) => debug!(?event, "store event"),
    }
  }

  result?;

  let payload = dispatcher
    .data(&key)
    .ok_or_else(|| eyre!("Nothing stored under '{}'", key))?;

  eprintln!("{} / {}", config.display_title(), key);
  if let Some(page) = Page::<serde_json::Value>::from_payload(&payload) {
    eprintln!(
      "page {}/{}{}",
      page.current_page,
      page.last_page,
      page
        .total
        .map(|t| format!(" ({} total)", t))
        .unwrap_or_default()
    );
  }
  println!("{}", serde_json::to_string_pretty(&payload)?);

  Ok(())
}
