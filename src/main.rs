use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

use wild_beans_lib::kitchen::{time_ago, BoardFilter, KitchenSession};
use wild_beans_lib::remote::{RemoteDataService, SupabaseClient};
use wild_beans_lib::tracker::OrderTracker;
use wild_beans_lib::{diagnostics, storage, AdminGate, Config};

const GATE_ENV: &str = "WILD_BEANS_GATE";

#[derive(Parser)]
#[command(name = "wild-beans", version, about = "Wild Beans event ordering console")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch an event's kitchen board
    Kitchen {
        /// Kitchen code of the event
        code: String,
        /// Include served and cancelled orders
        #[arg(long)]
        all: bool,
    },
    /// Follow one order until it is ready or cancelled
    Track {
        order_id: String,
    },
    /// Store connection settings from a provisioning string
    Provision {
        connection: String,
    },
    /// Remove stored connection settings
    Reset,
    /// Print build information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Info => {
            println!("{}", serde_json::to_string_pretty(&diagnostics::build_info())?);
            Ok(())
        }
        Command::Provision { connection } => {
            let provisioned = storage::provision(&connection).context("provisioning failed")?;
            println!("Stored connection for {}", provisioned.url);
            Ok(())
        }
        Command::Reset => {
            storage::factory_reset().context("reset failed")?;
            println!("Stored connection removed");
            Ok(())
        }
        Command::Kitchen { code, all } => {
            let config = Config::load()?;
            let _guard = diagnostics::init_logging(&config.log_dir);
            let filter = if all { BoardFilter::All } else { BoardFilter::Active };
            run_kitchen(&config, &code, filter).await
        }
        Command::Track { order_id } => {
            let config = Config::load()?;
            let _guard = diagnostics::init_logging(&config.log_dir);
            run_tracker(&config, &order_id).await
        }
    }
}

fn connect(config: &Config) -> anyhow::Result<Arc<dyn RemoteDataService>> {
    let client = SupabaseClient::new(config)?;
    Ok(Arc::new(client))
}

async fn run_kitchen(config: &Config, code: &str, filter: BoardFilter) -> anyhow::Result<()> {
    let gate = AdminGate::from_config(config)?;
    let typed = Zeroizing::new(std::env::var(GATE_ENV).unwrap_or_default());
    if typed.is_empty() {
        bail!("set {GATE_ENV} to the admin secret to open the kitchen board");
    }
    gate.unlock(typed)?;

    let remote = connect(config)?;
    let session = KitchenSession::open_by_code(remote, code, filter).await?;
    let mut board = session.board();
    info!(code, event_id = ?session.event_id(), "kitchen board open");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = board.changed() => {
                if changed.is_err() {
                    break;
                }
                if !gate.touch() {
                    warn!("admin session expired");
                    break;
                }
                let snapshot = board.borrow_and_update().clone();
                if snapshot.loading {
                    continue;
                }
                let [new, preparing, ready, served, cancelled] = snapshot.columns().counts();
                info!(new, preparing, ready, served, cancelled, "board updated");
                if let Some(notice) = &snapshot.notice {
                    warn!(notice = %notice, "board notice");
                }
                let now = chrono::Utc::now();
                for order in snapshot.visible() {
                    println!(
                        "{:<10} {:<10} {:<16} {}",
                        order.pickup_code,
                        order.status,
                        order.customer_name.as_deref().unwrap_or("-"),
                        time_ago(order.created_at, now),
                    );
                }
            }
        }
    }

    session.unmount().await;
    gate.logout();
    Ok(())
}

async fn run_tracker(config: &Config, order_id: &str) -> anyhow::Result<()> {
    let remote = connect(config)?;
    let tracker = OrderTracker::mount(remote, order_id, config.tracker());
    let mut view = tracker.view();
    let mut shown = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                if let Some(error) = &current.error {
                    warn!(order_id, error = %error, "tracker error");
                }
                if !current.loading && current.status.is_none() {
                    let reason = current.error.unwrap_or_else(|| "Order not found".into());
                    tracker.unmount().await;
                    bail!("{order_id}: {reason}");
                }
                if current.status != shown {
                    shown = current.status;
                    if let Some(message) = current.message() {
                        info!(order_id, feed = ?current.feed, status = ?current.status, "{message}");
                    }
                }
                if current.is_terminal() {
                    break;
                }
            }
        }
    }

    tracker.unmount().await;
    Ok(())
}
