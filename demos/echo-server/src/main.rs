use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dpm::config::{SessionConfig, TimerKind};
use dpm::wakeup::WakeupSource;

use dpm_os::callbacks::{
    CallbackFuture, ConnectEvent, InitEvent, RecvEvent, SessionCallbacks, TimerEvent,
};
use dpm_os::manager::{DpmManager, Registration};
use dpm_os::nvram::{JsonNvram, Nvram};
use dpm_os::retention::FileRegion;
use dpm_os::transport::TokioTransport;

// NVRAM key of the server port.
const SERVER_PORT_KEY: &str = "DPM_SERVER_PORT";
// Port used when neither the command line nor the NVRAM provide one.
const DEFAULT_PORT: u16 = 9000;

// Identifiers.
const ECHO_SESSION: u8 = 1;
const HEARTBEAT_TIMER: u8 = 1;

// Size of the retained wake counter.
const COUNTER_SIZE: usize = 4;

#[derive(Parser)]
#[command(
    version,
    about = "A TCP echo server going through simulated sleep cycles."
)]
struct Cli {
    /// Server port.
    ///
    /// Defaults to the `DPM_SERVER_PORT` NVRAM key, then to 9000.
    #[arg(long)]
    port: Option<u16>,
    /// Heartbeat timer interval, in seconds.
    #[arg(long, default_value_t = 5)]
    interval: u32,
    /// Time spent awake during each cycle, in seconds.
    #[arg(long, default_value_t = 15)]
    awake: u64,
    /// Time spent asleep during each cycle, in seconds.
    #[arg(long, default_value_t = 3)]
    asleep: u64,
    /// File simulating the retention memory.
    #[arg(long, default_value = "dpm-retention.json")]
    retention: PathBuf,
    /// File simulating the NVRAM.
    #[arg(long, default_value = "dpm-nvram.json")]
    nvram: PathBuf,
    /// Number of sleep cycles.
    #[arg(long, default_value_t = 3)]
    cycles: u32,
}

struct EchoSession;

impl SessionCallbacks for EchoSession {
    fn on_connect(&self, event: ConnectEvent) -> CallbackFuture {
        match (&event.result, event.peer) {
            (Ok(()), Some(peer)) => info!("Session `{}`: `{peer}` connected", event.session),
            (Ok(()), None) => info!("Session `{}`: connected", event.session),
            (Err(e), _) => warn!("Session `{}`: connection failed: {e}", event.session),
        }
        Box::pin(async {})
    }

    fn on_recv(&self, event: RecvEvent) -> CallbackFuture {
        Box::pin(async move {
            if event.is_closed() {
                info!("Session `{}`: `{}` left", event.session, event.peer);
                return;
            }

            info!(
                "Session `{}`: {} bytes from `{}`",
                event.session,
                event.data.len(),
                event.peer
            );
            if let Err(e) = event.reply(&event.data).await {
                error!("Session `{}`: impossible to echo: {e}", event.session);
            }
        })
    }
}

fn server_port(cli: &Cli) -> u16 {
    if let Some(port) = cli.port {
        return port;
    }

    let nvram = JsonNvram::open(&cli.nvram);
    match nvram.read_int(SERVER_PORT_KEY) {
        Ok(value) => u16::try_from(value).unwrap_or_else(|_| {
            warn!("NVRAM port {value} is out of range, use {DEFAULT_PORT}");
            DEFAULT_PORT
        }),
        Err(e) => {
            info!("{e}, use port {DEFAULT_PORT}");
            DEFAULT_PORT
        }
    }
}

// Increments the wake counter kept in retention memory.
fn count_wakeup(manager: &DpmManager) {
    let counter = manager
        .user_params()
        .and_then(|bytes| <[u8; COUNTER_SIZE]>::try_from(bytes).ok())
        .map_or(0, u32::from_le_bytes)
        .wrapping_add(1);

    info!("Wakeup number {counter}");
    if let Err(e) = manager.set_user_params(&counter.to_le_bytes()) {
        error!("Impossible to store the wake counter: {e}");
    }
}

fn configure(registration: &mut Registration, port: u16, interval: u32) {
    let _ = registration
        .boot_init(|event: InitEvent| async move {
            info!("Power-on boot");
            event.manager.print_session_info();
        })
        .wakeup_init(|event: InitEvent| async move {
            info!("Wake boot: {:?}", event.boot);
            count_wakeup(&event.manager);
        })
        .error(|code, message| error!("DPM error 0x{code:02X}: {message}"))
        .user_params(COUNTER_SIZE)
        .session(
            ECHO_SESSION,
            SessionConfig::tcp_server(port),
            Arc::new(EchoSession),
        )
        .timer(
            HEARTBEAT_TIMER,
            TimerKind::Periodic,
            interval,
            |event: TimerEvent| async move {
                info!("Timer `{}`: heartbeat", event.timer);
            },
        );
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let port = server_port(&cli);
    let interval = cli.interval;

    let region = Arc::new(FileRegion::open(&cli.retention));
    let transport = Arc::new(TokioTransport::new());

    let mut source = WakeupSource::PowerOn;
    for cycle in 1..=cli.cycles {
        let manager = DpmManager::builder(region.clone(), transport.clone())
            .wakeup_source(source)
            .sleep_timeout(Some(Duration::from_secs(cli.interval.into())))
            .build();
        manager.register_config_callback(move |registration| {
            configure(registration, port, interval);
        });

        if let Err(e) = manager.start().await {
            error!("Impossible to start the DPM manager: {e}");
            return;
        }
        info!("Cycle {cycle}: awake for {} seconds", cli.awake);

        // Use the Ctrl-C signal to stop the demo.
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(cli.awake)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return;
            }
        }

        manager.wait_sleep_permission().await;
        if let Err(e) = manager.request_sleep().await {
            error!("Impossible to enter sleep: {e}");
            return;
        }
        let _ = manager.print_session_config(ECHO_SESSION);
        drop(manager);

        info!("Cycle {cycle}: asleep for {} seconds", cli.asleep);
        tokio::time::sleep(Duration::from_secs(cli.asleep)).await;
        source = WakeupSource::RtcTimer;
    }
}
