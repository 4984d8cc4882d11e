//! Tributary: one permission-filtered, streamed event set over several stores.
//!
//! A deployment registers several heterogeneous backends (a primary SQLite
//! store, an append-only audit log, in-process plugin stores). Callers query
//! them through a single surface:
//!
//! 1. The [`core::federation::Federation`] resolves the stream query to one
//!    backend or fans it out to all of them.
//! 2. Each backend compiles the query into its own dialect
//!    ([`core::compile`]) and streams matching events back.
//! 3. Results are namespaced (`:backend:id`) so every id stays unique and
//!    routable ([`core::namespace`]).
//! 4. The per-caller [`core::pipeline::Pipeline`] filters by permission,
//!    projects legacy fields, minimizes deletions and injects attachment
//!    tokens; [`core::wire`] encodes the result as a streamed JSON array.
//!
//! # The Thin Waist
//!
//! Every backend is wrapped in a [`core::broker::StoreBroker`] at
//! registration, which logs each capability call and reclassifies raw storage
//! failures as `BackendUnavailable` for that backend.
//!
//! # Crate Structure
//!
//! - [`core`]: query algebra, coordinator, pipeline and storage plumbing
//! - [`plugins`]: backend implementations (sqlite, audit, memory, faulty)

pub mod core;
pub mod plugins;

use core::config::Config;
use core::error::Result;
use core::model::{Event, EventsQuery, PermissionSet, Stream, StreamsQuery};
use core::pipeline::Pipeline;
use core::query::StreamQuery;
use core::wire;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(
    name = "tributary",
    version = env!("CARGO_PKG_VERSION"),
    about = "Federated event storage over heterogeneous backends"
)]
pub struct Cli {
    /// Path to the TOML configuration.
    #[clap(long, default_value = "tributary.toml")]
    pub config: PathBuf,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub struct QueryCli {
    #[clap(long)]
    user: String,
    /// Stream query as JSON (array of blocks, one block, or a stream id).
    #[clap(long)]
    query: Option<String>,
    /// Restrict the query to one backend.
    #[clap(long)]
    store: Option<String>,
    /// Comma-separated readable stream ids, or `*`.
    #[clap(long, default_value = "*")]
    readable: String,
    /// Access id used for attachment read tokens.
    #[clap(long, default_value = "cli")]
    access: String,
    /// Issue attachment read tokens.
    #[clap(long)]
    attachments: bool,
    /// Literal text emitted before the array.
    #[clap(long)]
    prefix: Option<String>,
    #[clap(long)]
    from: Option<f64>,
    #[clap(long)]
    to: Option<f64>,
    /// Comma-separated event types.
    #[clap(long)]
    types: Option<String>,
    #[clap(long)]
    limit: Option<usize>,
    #[clap(long)]
    include_deletions: bool,
    /// Oldest first.
    #[clap(long)]
    ascending: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream matching events as a JSON array.
    Query(QueryCli),
    /// List stream trees.
    Streams {
        #[clap(long)]
        user: String,
        #[clap(long)]
        parent: Option<String>,
        #[clap(long)]
        store: Option<String>,
        #[clap(long)]
        include_trashed: bool,
    },
    /// Create an event from its JSON body.
    Create {
        #[clap(long)]
        user: String,
        #[clap(long)]
        event: String,
    },
    /// Create a stream from its JSON body.
    CreateStream {
        #[clap(long)]
        user: String,
        #[clap(long)]
        stream: String,
    },
    /// Delete an event by (namespaced) id.
    Delete {
        #[clap(long)]
        user: String,
        #[clap(long)]
        id: String,
    },
    /// Remove a user's data from every backend.
    DeleteUser {
        #[clap(long)]
        user: String,
    },
    /// Per-backend storage usage.
    Storage {
        #[clap(long)]
        user: String,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "json")]
        format: String,
    },
}

/// Install the `tracing` subscriber used by the binary (`RUST_LOG`, default
/// `info`), logging to stderr.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    let federation = plugins::boot(&config)?;
    let outcome = dispatch(&federation, &config, cli.command).await;
    federation.shutdown()?;
    outcome
}

async fn dispatch(
    federation: &core::federation::Federation,
    config: &Config,
    command: Command,
) -> Result<()> {
    match command {
        Command::Query(args) => {
            let perms = Arc::new(permissions(&args));
            let query = events_query(&args)?;
            let events = federation.query(&args.user, &query).await?;
            let filtered = Pipeline::for_caller(perms, &config.attachments.secret).run(events);
            let mut chunks = wire::json_array(filtered, args.prefix);
            let mut out = std::io::stdout();
            while let Some(chunk) = chunks.next().await {
                out.write_all(chunk?.as_bytes())?;
                out.flush()?;
            }
            writeln!(out)?;
        }
        Command::Streams {
            user,
            parent,
            store,
            include_trashed,
        } => {
            let query = StreamsQuery {
                parent_id: parent,
                include_trashed,
            };
            let streams = federation
                .get_streams(&user, &query, store.as_deref())
                .await?;
            print_json(&streams)?;
        }
        Command::Create { user, event } => {
            let event: Event = serde_json::from_str(&event)?;
            print_json(&federation.create_event(&user, event).await?)?;
        }
        Command::CreateStream { user, stream } => {
            let stream: Stream = serde_json::from_str(&stream)?;
            print_json(&federation.create_stream(&user, stream).await?)?;
        }
        Command::Delete { user, id } => {
            print_json(&federation.delete_event(&user, &id).await?)?;
        }
        Command::DeleteUser { user } => {
            federation.delete_user(&user).await?;
            print_json(&serde_json::json!({ "userDeletion": { "username": user } }))?;
        }
        Command::Storage { user, format } => {
            let infos = federation.storage_infos(&user).await?;
            if format == "text" {
                use colored::Colorize;
                for backend in federation.backends() {
                    let Some(info) = infos.get(&backend.id) else {
                        println!("{} {}: not supported", "○".dimmed(), backend.name.bold());
                        continue;
                    };
                    println!(
                        "{} {} ({}): {} events, {} streams, {} bytes",
                        "●".bright_green(),
                        backend.name.bold(),
                        backend.id,
                        info.event_count,
                        info.stream_count,
                        info.size_bytes
                    );
                }
            } else {
                print_json(&infos)?;
            }
        }
    }
    Ok(())
}

fn permissions(args: &QueryCli) -> PermissionSet {
    let readable = args
        .readable
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let perms = PermissionSet::new(&args.access, readable);
    if args.attachments {
        perms.with_attachments()
    } else {
        perms
    }
}

fn events_query(args: &QueryCli) -> Result<EventsQuery> {
    let mut streams = match &args.query {
        Some(text) => text.parse::<StreamQuery>()?,
        None => StreamQuery::unrestricted(),
    };
    if let Some(store) = &args.store {
        streams = streams.scoped_to(store);
    }
    Ok(EventsQuery {
        streams,
        from_time: args.from,
        to_time: args.to,
        types: args
            .types
            .as_deref()
            .map(|t| t.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        limit: args.limit,
        include_deletions: args.include_deletions,
        sort_ascending: args.ascending,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
