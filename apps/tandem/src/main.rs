mod cli;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use payload_codec::{CryptoContext, Opened};
use tandem_core::capture::{CaptureStatus, HttpAnalyzer, SyntheticCamera};
use tandem_core::session::{FileBookmark, MemoryBookmark, SessionBookmark, join_code};
use tandem_core::sync::LinkState;
use tandem_core::{
    Arbiter, CaptureAgent, Config, DisplayFeed, HandoffError, Peer, Reconciler, RedisSessionStore,
    SessionId, SessionManager, SharedStore, SyncHandle, telemetry,
};
use tracing::{error, info, warn};

use crate::cli::{Cli, Command, HostArgs, PeerArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(url) = cli.redis_url.clone() {
        config.redis_url = url;
    }
    let log_guard = telemetry::init_tracing(&config.log_filter, cli.log_file.as_deref())
        .context("failed to initialize logging")?;

    let crypto = Arc::new(config.crypto_context());

    match &cli.command {
        Command::Encrypt { payload } => {
            let value = serde_json::from_str::<serde_json::Value>(payload)
                .unwrap_or_else(|_| serde_json::Value::String(payload.clone()));
            println!("{}", payload_codec::encrypt(&crypto, &value)?);
            return Ok(());
        }
        Command::Decrypt { payload } => {
            match payload_codec::decrypt::<serde_json::Value>(&crypto, payload) {
                Opened::Decrypted(value) => println!("{value}"),
                Opened::Legacy(raw) => {
                    eprintln!("payload did not decrypt; showing it as-is");
                    println!("{raw}");
                }
            }
            return Ok(());
        }
        _ => {}
    }

    let store: SharedStore = Arc::new(
        RedisSessionStore::connect(&config.redis_url, config.session_ttl_seconds)
            .await
            .with_context(|| format!("failed to connect to {}", config.redis_url))?,
    );
    let bookmark: Arc<dyn SessionBookmark> = match cli.bookmark.clone().map(FileBookmark::new) {
        Some(bookmark) => Arc::new(bookmark),
        None => match FileBookmark::default_location() {
            Some(bookmark) => Arc::new(bookmark),
            None => {
                warn!("no config directory available; session bookmark kept in memory");
                Arc::new(MemoryBookmark::new())
            }
        },
    };
    let manager = SessionManager::new(store.clone(), bookmark);

    let outcome = dispatch(cli.command, &config, crypto, &manager).await;
    if let Err(err) = &outcome {
        if let Some(handoff) = err.downcast_ref::<HandoffError>() {
            if handoff.is_user_visible() {
                eprintln!("{handoff}");
                drop(log_guard);
                std::process::exit(1);
            }
        }
        error!(error = ?err, "tandem exited with an error");
    }
    outcome
}

async fn dispatch(
    command: Command,
    config: &Config,
    crypto: Arc<CryptoContext>,
    manager: &SessionManager,
) -> Result<()> {
    match command {
        Command::Host(args) => host(config, crypto, manager, args).await,
        Command::Join(args) => {
            let session = manager.verify_join_code(&args.code).await?;
            follow(config, crypto, manager, session, &args.peer).await
        }
        Command::Resume(args) => match manager.resume_last().await? {
            Some(session) => follow(config, crypto, manager, session, &args.peer).await,
            None => bail!("no session to resume"),
        },
        Command::Status { code } => {
            let session = join_code::normalize(&code)
                .ok_or_else(|| HandoffError::SessionNotFound(SessionId::new(code.trim())))?;
            let record = manager.snapshot(&session).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Terminate { code } => {
            let session = join_code::normalize(&code)
                .ok_or_else(|| HandoffError::SessionNotFound(SessionId::new(code.trim())))?;
            manager.terminate(&session).await?;
            println!("session {} terminated", join_code::display(&session));
            Ok(())
        }
        Command::Encrypt { .. } | Command::Decrypt { .. } => Ok(()),
    }
}

async fn host(
    config: &Config,
    crypto: Arc<CryptoContext>,
    manager: &SessionManager,
    args: HostArgs,
) -> Result<()> {
    let session = manager.create_session(&args.host_id).await?;
    println!("join code: {}", join_code::display(&session));
    println!("join link: {}", join_code::join_uri(&session));

    let peer = PeerArgs {
        peer: Peer::Web,
        watch: !args.capture,
        terminate_on_exit: !args.keep_open,
    };
    follow(config, crypto, manager, session, &peer).await
}

async fn follow(
    config: &Config,
    crypto: Arc<CryptoContext>,
    manager: &SessionManager,
    session: SessionId,
    peer: &PeerArgs,
) -> Result<()> {
    let store = manager.store().clone();
    let warm = crypto.clone();
    tokio::task::spawn_blocking(move || warm.warm());

    let arbiter = Arbiter::new(store.clone()).with_max_claim_attempts(config.max_claim_attempts);
    let agent = build_agent(config, crypto.clone(), arbiter.clone())?;
    let mut status = agent.status();

    let reconciler = Reconciler::new(peer.peer, session.clone(), agent, crypto)
        .with_bookmark(manager.bookmark().clone());
    let subscription = store.subscribe(&session).await.map_err(HandoffError::from)?;
    let handle = SyncHandle::spawn(reconciler, subscription);

    if !peer.watch {
        let grant = arbiter.claim(&session, peer.peer).await?;
        info!(session = %session, peer = %peer.peer, epoch = grant.epoch, "holding session");
    }

    let mut feed = handle.feed();
    let mut link = handle.link();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = handle.ended() => {
                println!("session ended");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                report_status(&current);
            }
            changed = feed.changed() => {
                if changed.is_ok() {
                    report_feed(&feed.borrow_and_update());
                }
            }
            changed = link.changed() => {
                if changed.is_ok() {
                    if let LinkState::Unavailable(reason) = &*link.borrow_and_update() {
                        eprintln!("session store unreachable: {reason}");
                    }
                }
            }
        }
    }

    handle.leave();
    if peer.terminate_on_exit {
        manager.terminate(&session).await?;
        println!("session {} terminated", join_code::display(&session));
    }
    Ok(())
}

fn build_agent(config: &Config, crypto: Arc<CryptoContext>, arbiter: Arbiter) -> Result<CaptureAgent> {
    let device = Arc::new(SyntheticCamera::new(320, 240));
    let agent = CaptureAgent::new(device, arbiter, crypto, config.capture_settings());
    match &config.analyzer_url {
        Some(url) => {
            let analyzer = HttpAnalyzer::new(url.clone()).context("failed to build analyzer client")?;
            Ok(agent.with_analyzer(Arc::new(analyzer)))
        }
        None => Ok(agent),
    }
}

fn report_status(status: &CaptureStatus) {
    match status {
        CaptureStatus::Idle => println!("capture: idle"),
        CaptureStatus::Capturing {
            epoch,
            frames_sent,
            uplink,
        } => println!("capture: epoch {epoch}, {frames_sent} frames sent, uplink {uplink:?}"),
        CaptureStatus::Failed(failure) => eprintln!("capture failed: {failure:?}"),
    }
}

fn report_feed(feed: &DisplayFeed) {
    match feed {
        DisplayFeed::Idle => println!("display: idle"),
        DisplayFeed::Local => println!("display: local camera"),
        DisplayFeed::Remote(frame) => println!(
            "display: frame from {} at {}{}",
            frame.source,
            frame.timestamp,
            if frame.legacy { " (unencrypted)" } else { "" }
        ),
    }
}
