//! routing-cli - drive routes against the simulated ledger
//!
//! ```bash
//! routing-cli seed
//! routing-cli deposit --to <seed> --amount 1000000000
//! routing-cli route --seed <seed> --tx <hash> --recipient <address>
//! routing-cli resume --tx <hash>
//! routing-cli inspect --tx <hash>
//! routing-cli demo --amount 1000000000
//! ```
//!
//! Ledger balances are kept in a JSON snapshot under the state directory so
//! consecutive invocations see the same ledger.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use ledger_client::{Account, Address, Amount, LedgerClient, SimulatedLedger, TxHash};
use routing_engine::value::format_units;
use routing_engine::{
    Config, EdgeStatus, FileRunStore, RouteEvent, RouteOutcome, RouteRequest, RouteScheduler,
    RunPhase, RunStore,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Stage-gated fund router
#[derive(Parser)]
#[command(name = "routing-cli")]
#[command(about = "Route an inbound transfer through fresh holding accounts")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "ROUTING_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for run state, seeds and the ledger snapshot
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a seed account to receive the inbound transfer
    Seed,

    /// Credit an address on the simulated ledger
    Deposit {
        /// Destination address
        #[arg(long)]
        to: String,

        /// Amount in base units
        #[arg(long)]
        amount: Amount,
    },

    /// Route an inbound transfer (prompts for missing values)
    Route {
        /// Seed address that received the transfer
        #[arg(long)]
        seed: String,

        /// Inbound transaction hash
        #[arg(long)]
        tx: Option<String>,

        /// Recipient address
        #[arg(long)]
        recipient: Option<String>,
    },

    /// Continue an aborted run
    Resume {
        /// Inbound transaction hash of the run
        #[arg(long)]
        tx: String,
    },

    /// Show a persisted run
    Inspect {
        /// Inbound transaction hash of the run
        #[arg(long)]
        tx: String,
    },

    /// Seed, deposit and route in one go
    Demo {
        /// Amount in base units
        #[arg(long, default_value_t = 1_000_000_000)]
        amount: Amount,

        /// Recipient address (fresh one if omitted)
        #[arg(long)]
        recipient: Option<String>,
    },
}

struct App {
    config: Config,
    ledger: Arc<SimulatedLedger>,
    store: Arc<FileRunStore>,
}

impl App {
    fn open(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?
                .with_env_overrides()?,
            None => Config::from_env()?,
        };
        if let Some(dir) = &cli.state_dir {
            config.storage.state_dir = dir.clone();
        }

        let store = Arc::new(FileRunStore::open(&config.storage.state_dir)?);
        let ledger = Arc::new(SimulatedLedger::open_or_create(
            config.storage.ledger_snapshot(),
            config.simulation_settings(),
        )?);

        Ok(Self {
            config,
            ledger,
            store,
        })
    }

    fn save_ledger(&self) -> anyhow::Result<()> {
        self.ledger
            .save_snapshot(self.config.storage.ledger_snapshot())
            .context("saving ledger snapshot")
    }

    fn units(&self, amount: Amount) -> String {
        format!(
            "{} {}",
            format_units(amount, self.config.units.decimals),
            self.config.units.symbol
        )
    }

    fn scheduler(&self, shutdown: watch::Receiver<bool>) -> RouteScheduler {
        RouteScheduler::new(self.ledger.clone(), self.store.clone(), &self.config)
            .with_shutdown(shutdown)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let app = App::open(&cli)?;

    match cli.command {
        Commands::Seed => {
            let seed = app.ledger.generate_account()?;
            app.store.save_seed(&seed)?;
            println!("{} Seed account {}", "✓".green().bold(), seed.address.to_string().yellow());
            Ok(())
        }
        Commands::Deposit { to, amount } => {
            let hash = app.ledger.deposit(&Address::new(to), amount);
            app.save_ledger()?;
            println!("{} Deposited {} in {}", "✓".green().bold(), app.units(amount), hash.to_string().yellow());
            Ok(())
        }
        Commands::Route { seed, tx, recipient } => {
            let seed = load_seed(&app, &Address::new(seed))?;
            let inbound = match tx {
                Some(tx) => TxHash::new(tx),
                None => TxHash::new(prompt("Inbound transaction hash")?),
            };
            let recipient = match recipient {
                Some(recipient) => Address::new(recipient),
                None => Address::new(prompt("Recipient address")?),
            };
            run(&app, RunCommand::Route(RouteRequest { inbound, seed, recipient })).await
        }
        Commands::Resume { tx } => run(&app, RunCommand::Resume(TxHash::new(tx))).await,
        Commands::Inspect { tx } => inspect(&app, &TxHash::new(tx)),
        Commands::Demo { amount, recipient } => {
            let seed = app.ledger.generate_account()?;
            app.store.save_seed(&seed)?;
            let inbound = app.ledger.deposit(&seed.address, amount);
            let recipient = match recipient {
                Some(recipient) => Address::new(recipient),
                None => app.ledger.generate_account()?.address,
            };
            info!("Demo: {} into {}, paying {}", amount, seed.address, recipient);
            run(&app, RunCommand::Route(RouteRequest { inbound, seed, recipient })).await
        }
    }
}

enum RunCommand {
    Route(RouteRequest),
    Resume(TxHash),
}

async fn run(app: &App, command: RunCommand) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current stage");
            let _ = shutdown_tx.send(true);
        }
    });

    let inbound = match &command {
        RunCommand::Route(request) => request.inbound.clone(),
        RunCommand::Resume(inbound) => inbound.clone(),
    };
    let scheduler = app.scheduler(shutdown_rx);
    let printer = tokio::spawn(print_events(
        scheduler.subscribe(),
        app.config.units.decimals,
        app.config.units.symbol.clone(),
    ));

    let result = match command {
        RunCommand::Route(request) => scheduler.route(request).await,
        RunCommand::Resume(inbound) => scheduler.resume(&inbound).await,
    };
    drop(scheduler);
    let _ = printer.await;
    app.save_ledger()?;

    match result {
        Ok(outcome) => {
            print_outcome(app, &outcome);
            Ok(())
        }
        Err(err) => {
            println!("{} {}", "✗".red().bold(), err);
            if err.is_resumable() {
                println!("  resume with: routing-cli resume --tx {}", inbound);
            }
            Err(err.into())
        }
    }
}

async fn print_events(
    mut events: tokio::sync::broadcast::Receiver<RouteEvent>,
    decimals: u32,
    symbol: String,
) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!("Missed {} progress events", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            RouteEvent::StageCompleted(summary) => {
                println!(
                    "{} {:<15} {} edge(s), {} {}",
                    "●".cyan(),
                    summary.stage.to_string().bold(),
                    summary.edges.len(),
                    format_units(summary.moved(), decimals),
                    symbol
                );
                for edge in &summary.edges {
                    let status = match edge.status {
                        EdgeStatus::Confirmed => "confirmed".green(),
                        EdgeStatus::Skipped => "skipped".yellow(),
                        _ => "unsettled".red(),
                    };
                    println!(
                        "    {:<6} -> {:<10} {:>24} fee {:<6} {}",
                        edge.from.to_string(),
                        edge.to.to_string(),
                        edge.amount,
                        edge.fee,
                        status
                    );
                }
            }
            RouteEvent::EdgeRetrying {
                edge,
                attempt,
                reason,
                ..
            } => println!("  {} {} attempt {}: {}", "↻".yellow(), edge, attempt, reason),
            RouteEvent::EdgeSkipped { edge, available } => {
                println!("  {} {} skipped ({} available)", "!".yellow(), edge, available)
            }
            _ => {}
        }
    }
}

fn print_outcome(app: &App, outcome: &RouteOutcome) {
    println!("{} Route complete", "✓".green().bold());
    println!("  inbound    {}", outcome.inbound.to_string().yellow());
    println!("  delivered  {}", app.units(outcome.delivered).bold());
    println!("  fees       {}", app.units(outcome.fees));
    println!("  transfers  {} ({} skipped)", outcome.transfers, outcome.skipped);
}

fn inspect(app: &App, inbound: &TxHash) -> anyhow::Result<()> {
    let state = app
        .store
        .load(inbound)?
        .with_context(|| format!("no run for {}", inbound))?;

    let phase = match &state.phase {
        RunPhase::Validating => "validating".normal(),
        RunPhase::Routing { stage } => format!("routing ({})", stage).cyan(),
        RunPhase::Completed { delivered } => format!("completed, {} delivered", app.units(*delivered)).green(),
        RunPhase::Aborted { stage, reason } => match stage {
            Some(stage) => format!("aborted at {}: {}", stage, reason).red(),
            None => format!("aborted: {}", reason).red(),
        },
    };

    println!("Run {} for {}", state.run_id.to_string().bold(), state.inbound.to_string().yellow());
    println!("  phase      {}", phase);
    println!("  inbound    {}", app.units(state.inbound_value));
    println!("  recipient  {}", state.recipient);
    println!(
        "  accounts   {} live, {} retired",
        state.accounts.len(),
        state.retired.len()
    );
    for (key, record) in &state.edges {
        println!(
            "    {:<18} {:<6} -> {:<10} {:>24} {:?} ({} attempt(s))",
            key.to_string(),
            record.from.to_string(),
            record.to.to_string(),
            record.amount,
            record.status,
            record.attempts
        );
    }
    Ok(())
}

fn load_seed(app: &App, address: &Address) -> anyhow::Result<Account> {
    match app.store.load_seed(address)? {
        Some(seed) => Ok(seed),
        None => bail!("unknown seed {}; create one with `routing-cli seed`", address),
    }
}

fn prompt(label: &str) -> anyhow::Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("{} is required", label);
    }
    Ok(value)
}
