use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use voicepool::audio::{
    AudioError, BindingManager, Buffer, BufferLoadStatus, Context, SourceId, VirtualDevice,
};
use voicepool::config::Settings;
use voicepool::init_app_dirs;
use voicepool::ui::{Args, Cli};

const LOG_TARGET: &str = "voicepool::main";

/// How often the player polls its context while a source plays.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::new();
    let args = &cli.args;

    init_app_dirs()?;

    let config_path = match &args.config {
        Some(path) => Path::new(path).to_path_buf(),
        None => Settings::default_path(),
    };
    let mut settings = Settings::load(&config_path)?;
    args.apply(&mut settings);
    settings.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .init();
    info!(target: LOG_TARGET, "Using settings from {}", config_path.display());

    let device = Arc::new(VirtualDevice::from_settings(&settings));
    let manager = BindingManager::new(device);
    let ctx = manager.create_context(&settings)?;
    manager.make_current(Some(&ctx))?;

    for name in &args.files {
        if let Err(e) = play_file(&cli, &ctx, name, args) {
            error!(target: LOG_TARGET, "Could not play {}: {}", name, e);
            cli.display_error(&e);
        }
    }

    manager.make_current(None)?;
    ctx.destroy()?;
    Ok(())
}

/// Waits for a background load to settle, servicing the context meanwhile.
fn wait_for_buffer(ctx: &Context, buffer: &Arc<Buffer>) -> Result<(), AudioError> {
    loop {
        match buffer.load_status() {
            BufferLoadStatus::Ready => return Ok(()),
            BufferLoadStatus::Failed => {
                return Err(AudioError::LoadFailed(format!("{} failed to load", buffer.name())))
            }
            BufferLoadStatus::Pending => {
                ctx.update()?;
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn play_file(cli: &Cli, ctx: &Arc<Context>, name: &str, args: &Args) -> Result<(), AudioError> {
    let source = ctx.create_source()?;
    let result = play_on(cli, ctx, source, name, args);
    let released = ctx.release_source(source);
    let buffer_removed = ctx.remove_buffer(name);
    result.and(released).and(buffer_removed)
}

fn play_on(cli: &Cli, ctx: &Arc<Context>, source: SourceId, name: &str, args: &Args) -> Result<(), AudioError> {
    if args.stream {
        let decoder = ctx.create_decoder(name)?;
        let detail = format!(
            "{} {}, {}hz, streaming",
            decoder.channel_config(),
            decoder.sample_type(),
            decoder.frequency()
        );
        ctx.play_stream_default(source, decoder)?;
        cli.display_now_playing(name, &detail);
    } else {
        let buffer = if args.async_load {
            let buffer = ctx.get_buffer_async(name)?;
            wait_for_buffer(ctx, &buffer)?;
            buffer
        } else {
            ctx.get_buffer(name)?
        };
        cli.display_now_playing(name, &Cli::describe_buffer(&buffer));
        ctx.play(source, &buffer)?;
    }

    let start = Instant::now();
    while ctx.is_playing(source)? {
        thread::sleep(POLL_INTERVAL);
        ctx.update()?;
        cli.display_progress(source, start.elapsed());
    }
    println!();
    Ok(())
}
