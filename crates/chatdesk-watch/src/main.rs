use anyhow::{Context, Result};
use chatdesk_core::classify::CategoryCounts;
use chatdesk_engine::{
    spawn, CommandSink, Connectivity, CoordinatorHandle, EngineConfig, HttpCommandSink,
    HttpPollSource, Notice, PollSource, PushSource, WsPushSource,
};
use chrono::Utc;
use clap::Parser;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "chatdesk-watch", about = "Follow a chat desk and print queue summaries")]
struct Args {
    #[arg(long, env = "CHATDESK_PUSH_URL")]
    push_url: String,
    #[arg(long, env = "CHATDESK_POLL_URL")]
    poll_url: String,
    #[arg(long, env = "CHATDESK_COMMAND_URL")]
    command_url: Option<String>,
    #[arg(long, env = "CHATDESK_SESSION_ID", default_value = "default")]
    session: String,
    #[arg(long, env = "CHATDESK_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval_secs: u64,
    #[arg(long, env = "CHATDESK_STANDBY_HOURS", default_value_t = 6)]
    standby_hours: i64,
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
    #[arg(long, default_value_t = 10)]
    request_timeout_secs: u64,
    #[arg(long, default_value_t = false)]
    no_bootstrap: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

struct Endpoints {
    push: Url,
    poll: Url,
    command: Option<Url>,
}

fn build_config(args: &Args) -> Result<(EngineConfig, Endpoints)> {
    let push = Url::parse(&args.push_url).context("invalid push url")?;
    let poll = Url::parse(&args.poll_url).context("invalid poll url")?;
    let command = args
        .command_url
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .map(Url::parse)
        .transpose()
        .context("invalid command url")?;
    let config = EngineConfig {
        session_id: args.session.clone(),
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        standby_window: chrono::Duration::hours(args.standby_hours.max(0)),
        heartbeat_timeout: Duration::from_secs(args.heartbeat_secs.max(1)),
        bootstrap_snapshot: !args.no_bootstrap,
        ..EngineConfig::default()
    };
    Ok((config, Endpoints { push, poll, command }))
}

fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn log_stdout_enabled() -> bool {
    env::var("CHATDESK_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}

/// Summaries go to stdout, so logs default to stderr.
fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = env::var("CHATDESK_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = if log_stdout_enabled() {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("log_init_error: subscriber already set");
    }
}

fn format_counts(version: u64, counts: CategoryCounts) -> String {
    format!(
        "v{version} all={} awaiting_operator={} awaiting_contact={} closed={}",
        counts.all, counts.awaiting_operator, counts.awaiting_contact, counts.closed
    )
}

fn log_notice(notice: Notice) {
    match notice {
        Notice::NewInbound(message) => info!(
            event = "new_inbound",
            conversation = %message.key,
            message_id = %message.id,
            display_name = %message.display_name
        ),
        Notice::SendFailed(failure) => warn!(
            event = "send_failed",
            code = %failure.code,
            reason = %failure.message,
            contact = ?failure.contact
        ),
        Notice::Connectivity(Connectivity::Degraded) => {
            warn!(event = "connectivity_degraded")
        }
        Notice::Connectivity(Connectivity::Restored) => {
            info!(event = "connectivity_restored")
        }
        Notice::Command(outcome) => info!(
            event = "command_outcome",
            request_id = %outcome.request_id,
            command = outcome.command.name(),
            status = ?outcome.status
        ),
    }
}

async fn watch(handle: &CoordinatorHandle) {
    let mut views = handle.subscribe();
    let mut states = handle.state_changes();
    let mut notices = handle.notices();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(event = "shutdown_requested");
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let version = views.borrow_and_update().version;
                let counts = handle.categories(Utc::now()).counts();
                println!("{}", format_counts(version, counts));
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(event = "coordinator_state_observed", state = %state);
            }
            notice = notices.recv() => match notice {
                Ok(notice) => log_notice(notice),
                Err(RecvError::Lagged(skipped)) => warn!(event = "notices_lagged", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);
    let (config, endpoints) = build_config(&args)?;
    let request_timeout = Duration::from_secs(args.request_timeout_secs.max(1));

    let push: Arc<dyn PushSource> = Arc::new(WsPushSource::new(endpoints.push.clone(), &config));
    let poll: Arc<dyn PollSource> = Arc::new(
        HttpPollSource::new(endpoints.poll.clone(), request_timeout)
            .context("failed to build poll client")?,
    );
    let commands: Option<Arc<dyn CommandSink>> = match endpoints.command {
        Some(url) => Some(Arc::new(
            HttpCommandSink::new(url, request_timeout).context("failed to build command client")?,
        )),
        None => None,
    };

    info!(
        event = "watch_started",
        session_id = %config.session_id,
        push_url = %endpoints.push,
        poll_url = %endpoints.poll
    );
    let (handle, task) = spawn(config, push, poll, commands);
    watch(&handle).await;
    handle.shutdown().await;
    task.await.context("coordinator task failed")?;
    Ok(())
}
