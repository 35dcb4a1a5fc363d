// Mixocracy sync engine entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file, the terminal is the console)
// 2. Load config
// 3. Open database
// 4. Load streaming tokens
// 5. Build ledger and streaming clients
// 6. Create mpsc channels
// 7. Spawn WebSocket server, queue poller and removal coordinator
// 8. Spawn app logic task
// 9. Run the console until quit or end of input
// 10. Cleanup on exit

use std::sync::Arc;
use std::time::Duration;

use mixocracy_sync::app;
use mixocracy_sync::config;
use mixocracy_sync::db;
use mixocracy_sync::ledger::rpc::JsonRpcLedger;
use mixocracy_sync::ledger::VoteLedger;
use mixocracy_sync::playback::auth::TokenStore;
use mixocracy_sync::playback::spotify::SpotifyClient;
use mixocracy_sync::playback::StreamingApi;
use mixocracy_sync::protocol::{UiUpdate, UserCommand};
use mixocracy_sync::queue::QueuePoller;
use mixocracy_sync::removal::{HttpRelay, RemovalCoordinator};
use mixocracy_sync::ws_server;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("Mixocracy sync engine starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: account={}, contract={}, rpc={}",
        config.ledger.account, config.ledger.contract_address, config.ledger.rpc_url
    );

    // 3. Open database
    let db = Arc::new(db::Database::open(&config.db_path).context("failed to open database")?);
    info!("Database opened at {}", config.db_path);

    // 4. Streaming tokens: persisted set first, credentials.toml as seed
    let tokens = Arc::new(TokenStore::load(db.clone(), &config.credentials));
    if tokens.get().is_none() {
        info!("No streaming tokens yet; the player page will request a login");
    }

    // 5. Clients
    let ledger: Arc<dyn VoteLedger> = Arc::new(
        JsonRpcLedger::from_config(&config.ledger).context("failed to build ledger client")?,
    );
    let streaming: Arc<dyn StreamingApi> = Arc::new(
        SpotifyClient::new(&config.spotify, tokens.clone())
            .context("failed to build streaming client")?,
    );

    // 6. Create mpsc channels
    let (ws_tx, ws_rx) = mpsc::channel(256);
    let (bridge_tx, bridge_rx) = mpsc::channel(64);
    let (poller_ctl_tx, poller_ctl_rx) = mpsc::channel(64);
    let (poller_tx, poller_rx) = mpsc::channel(64);
    let (removal_tx, removal_rx) = mpsc::channel(64);
    let (task_tx, task_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (ui_tx, mut ui_rx) = mpsc::channel::<UiUpdate>(256);

    // 7. Background tasks
    let ws_port = config.ws_port;
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_server::run(ws_port, ws_tx, bridge_rx).await {
            error!("WebSocket server error: {}", e);
        }
    });

    let poller = QueuePoller::new(
        ledger.clone(),
        Some(config.ledger.account),
        Duration::from_secs(config.polling.queue_interval_secs),
        Duration::from_secs(config.polling.roster_interval_secs),
        config.polling.optimistic_max_polls,
        poller_tx,
    );
    let poller_handle = tokio::spawn(poller.run(poller_ctl_rx));

    let relay = HttpRelay::from_config(&config.removal).context("failed to build relay client")?;
    let coordinator = RemovalCoordinator::new(
        relay,
        Duration::from_millis(config.removal.inter_item_delay_ms),
    )
    .with_poller(poller_ctl_tx.clone());
    let removal_handle = tokio::spawn(coordinator.run(removal_rx));

    // 8. Spawn app logic task
    let app_state = app::AppState::new(
        config.clone(),
        ledger,
        streaming,
        tokens,
        db,
        app::AppChannels {
            poller: poller_ctl_tx,
            removal: removal_tx,
            bridge: bridge_tx,
            tasks: task_tx,
            ui: ui_tx,
        },
    );
    let app_handle = tokio::spawn(async move {
        if let Err(e) = app::run(ws_rx, poller_rx, task_rx, cmd_rx, app_state).await {
            error!("Application loop error: {}", e);
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(update) = ui_rx.recv().await {
            println!("{update}");
        }
    });

    // 9. Console
    info!("Application ready. WebSocket server listening on 127.0.0.1:{}", ws_port);
    println!("mixocracy ready; open the player page and type `help` for commands");
    if let Err(e) = run_console(cmd_tx).await {
        error!("Console error: {}", e);
    }

    // 10. Cleanup: the app loop stops the poller; the removal queue drains
    // once the app loop has dropped its sender.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = app_handle.await;
        let _ = poller_handle.await;
        let _ = removal_handle.await;
    })
    .await;

    ws_handle.abort();
    printer.abort();

    info!("Mixocracy sync engine shut down cleanly");
    Ok(())
}

const HELP: &str = "\
commands:
  target <address>|none   follow a DJ's queue
  play | skip | pause | resume | stop
  vote <id> | unvote <id>
  add <name>[|<uri>]      add a track to your own queue
  remove <id>             remove a track from your own queue
  go-live | end-set       start or end your own set
  status | quit";

/// Read commands from stdin until `quit` or end of input.
async fn run_console(cmd_tx: mpsc::Sender<UserCommand>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "help" {
            println!("{HELP}");
            continue;
        }
        match line.parse::<UserCommand>() {
            Ok(cmd) => {
                let quit = cmd == UserCommand::Quit;
                if cmd_tx.send(cmd).await.is_err() || quit {
                    return Ok(());
                }
            }
            Err(e) => println!("{e} (type `help`)"),
        }
    }
    let _ = cmd_tx.send(UserCommand::Quit).await;
    Ok(())
}

/// Initialize tracing to log to a file (stdout belongs to the console).
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("mixocracy.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mixocracy_sync=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
