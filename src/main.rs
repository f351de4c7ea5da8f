use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use chrono::Utc;
use clap::{ArgAction, ArgGroup, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use agentbus::consumer::PollOutcome;
use agentbus::db::{BusStatus, Instance, Message, MessageType, Registration};
use agentbus::error::BusError;
use agentbus::notify::MessageEnvelope;
use agentbus::producer::SendOptions;
use agentbus::{Bus, BusConfig};

#[derive(Parser)]
#[command(name = "agentbus", author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Store file, overrides `store_path`
    #[arg(long, global = true, value_name = "PATH")]
    store: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the store if it does not exist
    Init,

    /// Enqueue a targeted or broadcast message
    #[command(group(ArgGroup::new("audience").required(true).args(["to", "broadcast"])))]
    #[command(group(ArgGroup::new("body").required(true).args(["payload", "payload_file"])))]
    Send {
        #[arg(long, value_name = "ID")]
        from: String,
        #[arg(long, value_name = "ID")]
        to: Option<String>,
        #[arg(long)]
        broadcast: bool,
        /// urgent, guidance, query, response, completion, broadcast, heartbeat
        #[arg(long = "type", value_name = "TYPE")]
        message_type: MessageType,
        /// Lower is more urgent; defaults per type
        #[arg(long)]
        priority: Option<i64>,
        /// Escalate after storing
        #[arg(long)]
        urgent: bool,
        #[arg(long, value_name = "TEXT")]
        payload: Option<String>,
        /// Read the payload from a file, or stdin with `-`
        #[arg(long, value_name = "PATH")]
        payload_file: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Claim (or peek at) the next message for an instance
    Recv {
        #[arg(long, value_name = "ID")]
        instance: String,
        /// Look without claiming
        #[arg(long, conflicts_with = "wait")]
        peek: bool,
        /// Run the consumer loop until a message arrives or time runs out
        #[arg(long)]
        wait: bool,
        #[arg(long, requires = "wait", value_name = "SECS")]
        poll_interval: Option<u64>,
        #[arg(long, requires = "wait", value_name = "SECS")]
        max_duration: Option<u64>,
        #[arg(long)]
        json: bool,
    },

    /// Register or refresh an instance
    Register {
        #[arg(long, value_name = "ID")]
        instance: String,
        /// Where the instance lives, e.g. a terminal pane
        #[arg(long, value_name = "HANDLE")]
        location: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        tag: String,
        #[arg(long, default_value = "")]
        workdir: String,
    },

    /// Mark an instance stopped
    Unregister {
        #[arg(long, value_name = "ID")]
        instance: String,
    },

    /// Refresh an instance's heartbeat
    Heartbeat {
        #[arg(long, value_name = "ID")]
        instance: String,
    },

    /// List registered instances
    List {
        /// Only active instances with a fresh heartbeat
        #[arg(long)]
        active_only: bool,
        #[arg(long)]
        json: bool,
    },

    /// Queue depth and instance counts
    Status {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<BusError>()
                .map(BusError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::WARN,
        (false, 1) => tracing::Level::INFO,
        (false, _) => tracing::Level::DEBUG,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<BusConfig> {
    let mut config = BusConfig::load(cli.config.as_deref())?;
    if let Some(store) = &cli.store {
        config.store_path = Some(store.display().to_string());
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Init => {
            let bus = Bus::init(config)?;
            println!("{}", bus.store_path().display());
        }

        Command::Send {
            from,
            to,
            broadcast,
            message_type,
            priority,
            urgent,
            payload,
            payload_file,
            json,
        } => {
            let body = read_payload(payload, payload_file.as_deref())?;
            let bus = Bus::open(config)?;
            let producer = bus.producer();
            let opts = SendOptions { urgent, priority };
            let id = match (to, broadcast) {
                (Some(to), false) => producer.send(&from, &to, message_type, body, opts)?,
                _ => producer.broadcast(&from, message_type, body, opts)?,
            };
            if json {
                println!("{}", serde_json::json!({ "id": id }));
            } else {
                println!("{id}");
            }
        }

        Command::Recv {
            instance,
            peek,
            wait,
            poll_interval,
            max_duration,
            json,
        } => {
            if let Some(secs) = poll_interval {
                config.consumer.poll_interval_secs = secs;
            }
            if let Some(secs) = max_duration {
                config.consumer.max_duration_secs = secs;
            }
            let bus = Bus::open(config)?;

            let msg = if peek {
                bus.db().peek(&instance)?
            } else if wait {
                match recv_wait(&bus, &instance).await? {
                    PollOutcome::Delivered(msg) => Some(msg),
                    PollOutcome::TimedOut | PollOutcome::Cancelled => None,
                    PollOutcome::Failed(e) => return Err(e.into()),
                }
            } else {
                bus.db().claim_next(&instance)?
            };
            print_message(msg.as_ref(), json)?;
        }

        Command::Register {
            instance,
            location,
            description,
            tag,
            workdir,
        } => {
            let bus = Bus::open(config)?;
            bus.register(&Registration {
                instance_id: instance,
                location_handle: location,
                description,
                initiative_tag: tag,
                workdir,
            })?;
            println!("ok");
        }

        Command::Unregister { instance } => {
            let bus = Bus::open(config)?;
            if !bus.unregister(&instance)? {
                tracing::warn!(instance = %instance, "instance was never registered");
            }
            println!("ok");
        }

        Command::Heartbeat { instance } => {
            let bus = Bus::open(config)?;
            if !bus.heartbeat(&instance)? {
                tracing::warn!(instance = %instance, "heartbeat for unregistered instance ignored");
            }
            println!("ok");
        }

        Command::List { active_only, json } => {
            let bus = Bus::open(config)?;
            let instances = bus.list_instances(active_only)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&instances)?);
            } else {
                print_instances(&instances);
            }
        }

        Command::Status { json } => {
            let bus = Bus::open(config)?;
            let status = bus.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&bus, &status);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Run one consumer loop; Ctrl-C cancels it.
async fn recv_wait(bus: &Bus, instance: &str) -> Result<PollOutcome> {
    let consumer = bus.consumer(instance);
    let cancel = consumer.cancel_token();
    let stop_watch = CancellationToken::new();
    let watcher = bus.watch_markers(&consumer, &stop_watch);
    let handle = consumer.spawn();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, stopping consumer");
            cancel.cancel();
        }
    });

    let outcome = handle.await.context("consumer task failed");
    stop_watch.cancel();
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    outcome
}

fn read_payload(text: Option<String>, file: Option<&str>) -> Result<Vec<u8>> {
    match (text, file) {
        (Some(text), _) => Ok(text.into_bytes()),
        (None, Some("-")) => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read payload from stdin")?;
            Ok(buf)
        }
        (None, Some(path)) => {
            std::fs::read(path).map_err(|e| BusError::invalid(format!("cannot read {path}: {e}")).into())
        }
        (None, None) => Err(BusError::invalid("no payload given").into()),
    }
}

fn print_message(msg: Option<&Message>, json: bool) -> Result<()> {
    let Some(msg) = msg else {
        println!("none");
        return Ok(());
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&MessageEnvelope::from_message(msg))?
        );
        return Ok(());
    }

    let to = msg.to_instance.as_deref().unwrap_or("*");
    println!(
        "#{} {} -> {} [{} p{}] {}",
        msg.id,
        msg.from_instance,
        to,
        msg.message_type,
        msg.priority,
        msg.created_at.to_rfc3339()
    );
    match msg.payload_text() {
        Some(text) => println!("{text}"),
        None => println!(
            "base64:{}",
            base64::engine::general_purpose::STANDARD.encode(&msg.payload)
        ),
    }
    Ok(())
}

fn print_instances(instances: &[Instance]) {
    if instances.is_empty() {
        println!("no instances");
        return;
    }
    let now = Utc::now();
    for inst in instances {
        let health = if inst.stale { "stale" } else { "fresh" };
        println!(
            "{:<20} {:<8} {:<6} {:>6}s  {}  {}",
            inst.instance_id,
            inst.status,
            health,
            inst.heartbeat_age(now).as_secs(),
            inst.location_handle,
            inst.initiative_tag,
        );
    }
}

fn print_status(bus: &Bus, status: &BusStatus) {
    let stale_after: Duration = bus.config().stale_after();
    println!("store:           {}", bus.store_path().display());
    println!("messages:        {}", status.messages_total);
    println!("queue depth:     {}", status.queue_depth);
    println!("open broadcasts: {}", status.open_broadcasts);
    println!("deliveries:      {}", status.deliveries);
    println!(
        "instances:       {} total, {} active ({} fresh, {} stale after {}s), {} stopped",
        status.instances.total,
        status.instances.active,
        status.instances.fresh,
        status.instances.stale,
        stale_after.as_secs(),
        status.instances.stopped,
    );
    for p in &status.pending {
        println!("  {:<20} {} pending", p.instance_id, p.pending);
    }
}
