//! Sealbox transfer daemon

mod args;

use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sealbox_common::{
    CIPHER_FORMAT, DownloadState, HubEvent, JobKey, TransferProgress, UploadState,
};
use sealbox_engine::{DownloadRequest, Engine, EngineConfig, Result, db::Database};

use args::{Args, Cmd};

/// How often waiting commands poll job state without hub events
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "sealbox_engine=debug,sealboxd=debug"
    } else {
        "sealbox_engine=info,sealboxd=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    args.apply(&mut config);
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    match args.command {
        Cmd::List => list(&config).await,
        Cmd::Run => {
            let engine = Engine::open(config).await?;
            serve(&engine).await;
            engine.shutdown().await;
            Ok(())
        }
        Cmd::Upload {
            path,
            directory,
            detach,
        } => {
            let engine = Engine::open(config).await?;
            let key = engine.submit_upload(&path, &directory).await?;
            println!("Queued {key}");
            if !detach {
                wait_for(&engine, &key).await?;
            }
            engine.shutdown().await;
            Ok(())
        }
        Cmd::Download {
            content_id,
            host,
            object_key,
            nonce,
            format,
            size,
            output,
            open,
            detach,
        } => {
            let engine = Engine::open(config).await?;
            let key = engine
                .submit_download(DownloadRequest {
                    content_id,
                    host_url: host,
                    encrypted_size: size,
                    format,
                    key: object_key,
                    nonce,
                    output_path: output,
                    file_name: None,
                    auto_open: open,
                })
                .await?;
            println!("Queued {key}");
            if !detach {
                wait_for(&engine, &key).await?;
            }
            engine.shutdown().await;
            Ok(())
        }
        Cmd::Resume { job } => {
            let engine = Engine::open(config).await?;
            let key = job.key(&engine.config().user_id);
            engine.resume(&key)?;
            engine.shutdown().await;
            println!("Resumed {key}");
            Ok(())
        }
        Cmd::Remove { job } => {
            let engine = Engine::open(config).await?;
            let key = job.key(&engine.config().user_id);
            engine.cancel(&key, true)?;
            engine.shutdown().await;
            println!("Removed {key}");
            Ok(())
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn list(config: &EngineConfig) -> Result<()> {
    let db = Database::open(&config.database_path()?).await?;
    let uploads = db.uploads.list(&config.user_id).await?;
    let downloads = db.downloads.list(&config.user_id).await?;

    println!("Uploads:");
    for job in &uploads {
        let total = job.encrypted_size.unwrap_or(job.clear_size);
        println!(
            "  upload:{:<6} {:<26} {:>12}/{:<12} {}{}",
            job.id,
            job.state,
            job.position,
            total,
            job.display_path,
            job.error
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default()
        );
    }
    println!("Downloads:");
    for job in &downloads {
        println!(
            "  download:{} {:<12} {:>12}/{:<12} {}{}",
            job.content_id,
            job.state,
            job.position,
            job.encrypted_size.unwrap_or(0),
            job.output_path.display(),
            job.error
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default()
        );
    }

    db.close().await;
    Ok(())
}

/// Act on pending add-file commands
///
/// Without a metadata service the configured filehost is accepted as the
/// object's host as soon as the command is seen.
fn serve_commands(engine: &Engine) {
    let Some(host_url) = engine.config().filehost_url.clone() else {
        return;
    };
    for command in engine.consume_commands() {
        info!(
            job = command.job_id,
            content_id = %command.content_id,
            format = %command.format,
            "add-file command"
        );
        if command.format != CIPHER_FORMAT
            || engine.confirm_command(command.job_id, &host_url).is_err()
        {
            let _ = engine.command_failed(command.job_id);
        }
    }
    for ready in engine.consume_ready() {
        println!("Ready: {}", ready.output_path);
    }
}

/// Run until Ctrl-C
async fn serve(engine: &Engine) {
    let (mut listener, mut events) = engine.subscribe();
    if engine.config().filehost_url.is_none() {
        warn!("no filehost configured, uploads will wait for their add-file command");
    }
    info!("running, press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                if event.is_none() {
                    // Evicted; listen again
                    (listener, events) = engine.subscribe();
                }
            }
            _ = ticker.tick() => {}
        }
        serve_commands(engine);
    }
    engine.unsubscribe(listener);
}

/// Print progress for one job until it settles
async fn wait_for(engine: &Engine, key: &JobKey) -> Result<()> {
    let (mut listener, mut events) = engine.subscribe();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        serve_commands(engine);
        if let Some(summary) = settled(engine, key).await? {
            println!("{key}: {summary}");
            break;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("{key}: interrupted, will resume on next run");
                break;
            }
            event = events.recv() => match event {
                Some(HubEvent::Progress { progress }) if &progress.job == key => {
                    print_progress(&progress);
                }
                Some(_) => {}
                None => (listener, events) = engine.subscribe(),
            },
            _ = ticker.tick() => {}
        }
    }

    engine.unsubscribe(listener);
    Ok(())
}

fn print_progress(progress: &TransferProgress) {
    eprintln!(
        "  {:?}: {:5.1}% ({}/{})",
        progress.stage,
        progress.percent(),
        progress.position,
        progress.total
    );
}

/// Terminal description of a job, or None while it is still moving
async fn settled(engine: &Engine, key: &JobKey) -> Result<Option<String>> {
    let summary = match key {
        JobKey::Upload { id } => engine.upload(*id).await?.and_then(|job| match job.state {
            UploadState::Done => Some(format!(
                "done, content id {}",
                job.content_id.unwrap_or_default()
            )),
            UploadState::Error => Some(format!("error: {}", job.error.unwrap_or_default())),
            _ => None,
        }),
        JobKey::Download { content_id, .. } => {
            engine
                .download(content_id)
                .await?
                .and_then(|job| match job.state {
                    DownloadState::Done => Some(format!("saved to {}", job.output_path.display())),
                    DownloadState::Error | DownloadState::Paused => Some(format!(
                        "{}: {}",
                        job.state,
                        job.error.unwrap_or_default()
                    )),
                    _ => None,
                })
        }
    };

    // A deleted job has settled too
    match summary {
        Some(summary) => Ok(Some(summary)),
        None if !exists(engine, key).await? => Ok(Some("removed".to_string())),
        None => Ok(None),
    }
}

async fn exists(engine: &Engine, key: &JobKey) -> Result<bool> {
    Ok(match key {
        JobKey::Upload { id } => engine.upload(*id).await?.is_some(),
        JobKey::Download { content_id, .. } => engine.download(content_id).await?.is_some(),
    })
}
