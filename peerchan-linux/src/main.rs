// peerchan Linux: echo daemon over two loopback peers, hosted on a tokio current-thread runtime.

mod config;

use std::sync::{Arc, Weak};

use anyhow::{anyhow, Context};
use peerchan_core::{
    host_loop, ConnectionState, HostScheduler, LoopbackNetwork, LoopbackOpener, PeerSession, Role,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What the calling side reports back to the run loop.
enum AppEvent {
    Open,
    Reply(Vec<u8>),
    Failed(String),
}

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("peerchan-linux {}", VERSION);
            return Ok(());
        }
    }

    init_tracing();
    let cfg = config::load();
    info!(version = VERSION, ?cfg, "starting peerchan echo daemon");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building host runtime")?;
    rt.block_on(run(cfg))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let (handle, mut host) = host_loop();
    let scheduler: Arc<dyn HostScheduler> = Arc::new(handle);
    let opener = LoopbackOpener::new(LoopbackNetwork::new());
    peerchan_core::pre_generate_cert(&opener)
        .map_err(|status| anyhow!("certificate pre-generation failed (status {status})"))?;

    let open = |role| {
        PeerSession::builder(role)
            .engine_config(cfg.engine_config())
            .config(cfg.session_config())
            .scheduler(scheduler.clone())
            .open(&opener)
            .map(Arc::new)
            .with_context(|| format!("opening {role} session"))
    };
    let caller = open(Role::Controlling)?;
    let echoer = open(Role::Controlled)?;
    relay_signaling(&caller, &echoer);
    serve_echo(&echoer, cfg.echo_prefix.clone());

    let (app_tx, mut app_rx) = mpsc::unbounded_channel();
    {
        let tx = app_tx.clone();
        caller.on_state(move |state| {
            if state == ConnectionState::DataChannelOpened {
                let _ = tx.send(AppEvent::Open);
            } else if state == ConnectionState::ConnectFailed {
                let _ = tx.send(AppEvent::Failed("connection failed".into()));
            }
        });
        let tx = app_tx.clone();
        caller.on_data(move |data| {
            let _ = tx.send(AppEvent::Reply(data));
        });
        let tx = app_tx;
        caller.on_error(move |message| {
            let _ = tx.send(AppEvent::Failed(message));
        });
    }

    echoer.start_connection()?;
    caller.create_offer()?;

    let deadline = tokio::time::sleep(cfg.connect_timeout());
    tokio::pin!(deadline);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut channel_open = false;
    let mut sent: u32 = 0;
    let mut replies: u32 = 0;
    let outcome = loop {
        tokio::select! {
            more = host.next_turn() => {
                if !more {
                    break Err(anyhow!("host loop closed"));
                }
            }
            Some(event) = app_rx.recv() => match event {
                AppEvent::Open => {
                    channel_open = true;
                    info!("data channel open");
                    if cfg.messages == 0 {
                        break Ok(());
                    }
                    send_next(&caller, &mut sent);
                }
                AppEvent::Reply(data) => {
                    replies += 1;
                    info!(reply = %String::from_utf8_lossy(&data), replies, "echo received");
                    if replies >= cfg.messages {
                        info!(replies, "all round trips done");
                        break Ok(());
                    }
                    send_next(&caller, &mut sent);
                }
                AppEvent::Failed(message) => {
                    error!(%message, "caller session failed");
                    break Err(anyhow!(message));
                }
            },
            _ = &mut deadline, if !channel_open => {
                break Err(anyhow!(
                    "data channel not open after {}s (state {})",
                    cfg.connect_timeout_secs,
                    caller.state()
                ));
            }
            res = &mut shutdown => {
                if res.is_ok() {
                    info!("shutdown signal received");
                }
                break res;
            }
        }
    };

    caller.close_sync();
    echoer.close_sync();
    info!(
        dropped = caller.dropped_events() + echoer.dropped_events(),
        "sessions closed"
    );
    outcome
}

fn send_next(caller: &PeerSession, sent: &mut u32) {
    *sent += 1;
    let text = format!("message {sent}");
    match caller.send_text(&text) {
        Ok(()) => debug!(%text, "sent"),
        Err(e) => warn!(error = %e, "send failed"),
    }
}

/// Forward each side's local descriptions and candidates to the other side.
fn relay_signaling(caller: &Arc<PeerSession>, echoer: &Arc<PeerSession>) {
    let to_echoer = Arc::downgrade(echoer);
    let to_caller = Arc::downgrade(caller);

    caller.on_offer(forward(to_echoer.clone(), |peer, sdp| peer.set_remote_description(sdp)));
    caller.on_answer(forward(to_echoer.clone(), |peer, sdp| peer.set_remote_description(sdp)));
    caller.on_ice(forward(to_echoer, |peer, c| peer.add_ice_candidate(c)));
    echoer.on_offer(forward(to_caller.clone(), |peer, sdp| peer.set_remote_description(sdp)));
    echoer.on_answer(forward(to_caller.clone(), |peer, sdp| peer.set_remote_description(sdp)));
    echoer.on_ice(forward(to_caller, |peer, c| peer.add_ice_candidate(c)));
}

fn forward<F>(peer: Weak<PeerSession>, apply: F) -> impl Fn(String) + Send + Sync + 'static
where
    F: Fn(&PeerSession, &str) -> peerchan_core::Result<()> + Send + Sync + 'static,
{
    move |text| {
        let Some(peer) = peer.upgrade() else {
            return;
        };
        if let Err(e) = apply(&peer, &text) {
            warn!(error = %e, role = %peer.role(), "signaling relay rejected");
        }
    }
}

/// The controlled side sends every message back with `prefix`.
fn serve_echo(echoer: &Arc<PeerSession>, prefix: String) {
    let weak = Arc::downgrade(echoer);
    echoer.on_data(move |data| {
        let Some(echoer) = weak.upgrade() else {
            return;
        };
        let mut reply = prefix.clone().into_bytes();
        reply.extend_from_slice(&data);
        if let Err(e) = echoer.send(&reply) {
            warn!(error = %e, "echo failed");
        }
    });
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
