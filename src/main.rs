use clap::{Parser, Subcommand};
use fs2::FileExt;
use log::{info, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use offstream::config::RecorderConfig;
use offstream::db::{StreamerRoster, SyncDb};
use offstream::hls::HlsResolver;
use offstream::ipfs::IpfsClient;
use offstream::schedule::Scheduler;

#[derive(Parser, Debug)]
#[command(author, version, about = "Record live streams to IPFS as HLS playlists")]
struct Args {
    /// Path to config file (TOML format)
    #[arg(short, long, global = true, default_value = "offstream.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch all streamers and record whoever is live
    Record {
        /// Check the roster once and wait for those recordings to end
        #[arg(long)]
        once: bool,
    },
    /// Create the database tables
    Init,
    /// Start watching a streamer
    AddStreamer {
        name: String,

        /// Highest quality to record, e.g. 720p, 1080p60, best, audio_only
        #[arg(short, long)]
        quality: Option<String>,
    },
    /// Change the highest quality recorded for a streamer
    SetQuality { name: String, quality: String },
    /// Stop watching a streamer and forget its streams
    RemoveStreamer { name: String },
    /// Show watched streamers
    ListStreamers,
    /// Show recorded streams, newest first
    Streams {
        /// Only streams of this streamer
        name: Option<String>,

        #[arg(short = 'n', long, default_value = "20")]
        limit: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = RecorderConfig::load(&args.config)?;

    match args.command {
        Command::Record { once } => record(config, once),
        Command::Init => {
            open_db(&config.database_path)?;
            println!("Initialized {}", config.database_path.display());
            Ok(())
        }
        Command::AddStreamer { name, quality } => {
            let db = open_db(&config.database_path)?;
            let streamer = db.add_streamer(&name, quality.as_deref())?;
            println!("Added {} ({})", streamer.name, streamer.max_quality);
            Ok(())
        }
        Command::SetQuality { name, quality } => {
            let db = open_db(&config.database_path)?;
            db.set_streamer_quality(&name, &quality)?;
            if let Some(streamer) = db.streamer(&name)? {
                println!("{} now records up to {}", streamer.name, streamer.max_quality);
            }
            Ok(())
        }
        Command::RemoveStreamer { name } => {
            let db = open_db(&config.database_path)?;
            if !db.remove_streamer(&name)? {
                return Err(format!("Streamer '{}' not found", name).into());
            }
            println!("Removed {}", name.to_lowercase());
            Ok(())
        }
        Command::ListStreamers => {
            let db = open_db(&config.database_path)?;
            for streamer in db.streamers()? {
                println!("{}\t{}", streamer.name, streamer.max_quality);
            }
            Ok(())
        }
        Command::Streams { name, limit } => {
            let db = open_db(&config.database_path)?;
            if let Some(name) = &name {
                if db.streamer(name)?.is_none() {
                    return Err(format!("Streamer '{}' not found", name).into());
                }
            }
            for stream in db.latest_streams(name.as_deref(), limit)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    stream.id,
                    stream.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    stream.title.as_deref().unwrap_or("-"),
                    stream.url.as_deref().unwrap_or("(not uploaded yet)")
                );
            }
            Ok(())
        }
    }
}

fn open_db(path: &Path) -> Result<SyncDb, Box<dyn std::error::Error>> {
    let db = SyncDb::connect(path)
        .map_err(|e| format!("Failed to open database '{}': {}", path.display(), e))?;
    db.init_schema()?;
    Ok(db)
}

fn record(config: RecorderConfig, once: bool) -> Result<(), Box<dyn std::error::Error>> {
    // Acquire exclusive lock to prevent multiple recorders on one database
    let lock_path = config.lock_path();
    let _lock_file = File::create(&lock_path)
        .map_err(|e| format!("Failed to create lock file '{}': {}", lock_path.display(), e))?;
    _lock_file.try_lock_exclusive().map_err(|_| {
        format!(
            "Another recorder is already using '{}'. Lock file: {}",
            config.database_path.display(),
            lock_path.display()
        )
    })?;

    let db = Arc::new(open_db(&config.database_path)?);
    let resolver = Arc::new(HlsResolver::new(
        config.stream_url_template.clone(),
        config.http_timeout(),
    )?);
    let content = Arc::new(IpfsClient::new(
        &config.ipfs_api_address,
        config.http_timeout(),
        config.request_size_limit_bytes,
    )?);
    info!(
        "Flushing every {} bytes to {}",
        config.flush_threshold(),
        config.ipfs_api_address
    );

    let scheduler = Arc::new(Scheduler::new(
        &config,
        db.clone(),
        resolver,
        db,
        content,
    )?);
    spawn_signal_handler(Arc::clone(&scheduler))?;

    if once {
        scheduler.run_once();
        while !scheduler.wait_idle(Duration::from_secs(60)) {}
    } else {
        scheduler.start();
    }
    scheduler.close();
    Ok(())
}

/// First Ctrl-C closes the recorders gracefully, the second one aborts them
fn spawn_signal_handler(scheduler: Arc<Scheduler>) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let mut interrupts = 0;
            loop {
                if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    return;
                }
                interrupts += 1;
                let scheduler = Arc::clone(&scheduler);
                if interrupts == 1 {
                    info!("Interrupted, finishing uploads (press Ctrl-C again to abort)");
                    thread::spawn(move || scheduler.close());
                } else {
                    warn!("Aborting, queued uploads are dropped");
                    thread::spawn(move || scheduler.abort());
                }
            }
        })?;
    Ok(())
}
