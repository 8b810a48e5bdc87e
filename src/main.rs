use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vizhost::audio::list_input_devices;
use vizhost::config::{ConfigUpdate, DEFAULT_HOST, DEFAULT_PORT, Settings};
use vizhost::pipeline::Pipeline;
use vizhost::protocol::{CommandResponse, StatusResponse};
use vizhost::server::run_server;

#[derive(Parser)]
#[command(name = "vizhost")]
#[command(about = "Real-time audio analysis and streaming service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by `service` and `configure`
#[derive(clap::Args, Debug, Default)]
struct AudioArgs {
    /// Input device index or name (see `vizhost devices`)
    #[arg(long)]
    device: Option<String>,

    /// Sample rate in Hz
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Channel count (1-8)
    #[arg(long)]
    channels: Option<u16>,

    /// FFT size, power of two between 256 and 16384
    #[arg(long)]
    fft_size: Option<usize>,

    /// Maximum analysis frames per second (10-120)
    #[arg(long)]
    fps: Option<u32>,

    /// Spectrum gain (0.2-4.0)
    #[arg(long)]
    gain: Option<f32>,

    /// Spectrum smoothing (0.0-0.95)
    #[arg(long)]
    smoothing: Option<f32>,
}

impl AudioArgs {
    fn to_update(&self) -> ConfigUpdate {
        let (device_id, device_name) = match self.device.as_deref() {
            Some(device) => parse_device(device),
            None => (None, None),
        };

        ConfigUpdate {
            device_id,
            device_name,
            sample_rate: self.sample_rate,
            channels: self.channels,
            fft_size: self.fft_size,
            fps_cap: self.fps,
            gain: self.gain,
            smoothing: self.smoothing,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the analysis service
    Service {
        /// Address to listen on
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Settings file (defaults to the user config directory)
        #[arg(long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        audio: AudioArgs,
    },

    /// List available audio input devices
    Devices,

    /// Show the state of a running service
    Status {
        /// Service base URL
        #[arg(long, default_value_t = default_url())]
        url: String,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Change options of a running service
    Configure {
        /// Service base URL
        #[arg(long, default_value_t = default_url())]
        url: String,

        #[command(flatten)]
        audio: AudioArgs,
    },
}

fn default_url() -> String {
    format!("http://{DEFAULT_HOST}:{DEFAULT_PORT}")
}

/// A numeric argument selects by index, anything else by name
fn parse_device(device: &str) -> (Option<usize>, Option<String>) {
    match device.trim().parse::<usize>() {
        Ok(id) => (Some(id), None),
        Err(_) => (None, Some(device.to_string())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("VIZHOST_LOG", "info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Service {
            host,
            port,
            config,
            audio,
        } => run_service(host, port, config, audio).await,
        Commands::Devices => print_devices(),
        Commands::Status { url, json } => print_status(&url, json).await,
        Commands::Configure { url, audio } => configure(&url, &audio).await,
    }
}

async fn run_service(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<PathBuf>,
    audio: AudioArgs,
) -> Result<()> {
    let settings = Settings::load(config_path.as_deref());
    let host = host.unwrap_or(settings.server.host);
    let port = port.unwrap_or(settings.server.port);
    let config = settings
        .audio
        .clamped()
        .apply(&audio.to_update())
        .context("Invalid audio options")?;

    log::info!("Starting vizhost service");
    let pipeline = Arc::new(Pipeline::new(config)?);
    pipeline.start().await?;

    let server_pipeline = Arc::clone(&pipeline);
    let mut server =
        tokio::spawn(async move { run_server(&host, port, server_pipeline).await });

    let result = tokio::select! {
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received");
            Ok(())
        }
        joined = &mut server => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow!(e)),
            Err(e) => Err(anyhow!("Server task failed: {}", e)),
        },
    };

    pipeline.stop().await;
    if !server.is_finished()
        && tokio::time::timeout(Duration::from_secs(2), &mut server).await.is_err()
    {
        log::warn!("HTTP server did not shut down in time");
        server.abort();
    }
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => log::warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn print_devices() -> Result<()> {
    let devices = list_input_devices()?;
    if devices.is_empty() {
        println!("No audio input devices found");
        return Ok(());
    }

    println!("Available Audio Devices:");
    println!(
        "{:<4} {:<40} {:<10} {:<10} Sample Rate",
        "ID", "Name", "Default", "Channels"
    );
    println!("{}", "-".repeat(80));

    for device in devices {
        let default_str = if device.is_default { "YES" } else { "NO" };
        let name: String = device.name.chars().take(40).collect();
        println!(
            "{:<4} {:<40} {:<10} {:<10} {}",
            device.id, name, default_str, device.max_input_channels, device.default_sample_rate
        );
    }

    Ok(())
}

async fn print_status(url: &str, json: bool) -> Result<()> {
    let endpoint = format!("{}/api/state", url.trim_end_matches('/'));
    let response = reqwest::get(&endpoint)
        .await
        .with_context(|| format!("Failed to reach service at {url}"))?
        .error_for_status()?;

    if json {
        let value: serde_json::Value = response.json().await?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let status: StatusResponse = response.json().await?;
    println!("Service Status:");
    println!("  Status:      {}", status.status.as_str());
    if let Some(error) = &status.last_error {
        println!("  Last error:  {}", error);
    }
    match &status.device {
        Some(device) => println!("  Device:      [{}] {}", device.id, device.name),
        None => println!("  Device:      none"),
    }
    println!(
        "  Format:      {} Hz, {} ch",
        status.config.sample_rate, status.config.channels
    );
    println!(
        "  Analysis:    fft {}, {} fps, gain {:.2}, smoothing {:.2}",
        status.config.fft_size, status.config.fps_cap, status.config.gain, status.config.smoothing
    );
    println!("  Clients:     {}", status.clients);
    println!("  Uptime:      {}s", status.uptime_seconds);

    if let Some(metrics) = &status.metrics {
        let levels: Vec<String> = metrics
            .rms
            .iter()
            .zip(&metrics.peak)
            .map(|(rms, peak)| format!("{rms:.3}/{peak:.3}"))
            .collect();
        println!("  Frame:       {} at {:.2}s", metrics.frame_id, metrics.timestamp);
        println!("  RMS/peak:    {}", levels.join("  "));
        match metrics.correlation {
            Some(c) => println!("  Correlation: {c:.3}"),
            None => println!("  Correlation: n/a"),
        }
    }

    Ok(())
}

async fn configure(url: &str, audio: &AudioArgs) -> Result<()> {
    let update = audio.to_update();
    if update.is_empty() {
        bail!("Nothing to change; pass at least one option (see --help)");
    }

    let endpoint = format!("{}/api/options", url.trim_end_matches('/'));
    let reply: CommandResponse = reqwest::Client::new()
        .post(&endpoint)
        .json(&update)
        .send()
        .await
        .with_context(|| format!("Failed to reach service at {url}"))?
        .json()
        .await?;

    if !reply.ok {
        bail!(
            "Service rejected the change: {}",
            reply.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    println!("Configuration updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!(parse_device("2"), (Some(2), None));
        assert_eq!(parse_device("USB Interface"), (None, Some("USB Interface".to_string())));
    }

    #[test]
    fn test_audio_args_to_update() {
        let args = AudioArgs {
            device: Some("Loopback".to_string()),
            fps: Some(30),
            ..Default::default()
        };
        let update = args.to_update();
        assert_eq!(update.device_name.as_deref(), Some("Loopback"));
        assert_eq!(update.fps_cap, Some(30));
        assert!(update.gain.is_none());
        assert!(AudioArgs::default().to_update().is_empty());
    }

    #[test]
    fn test_cli_parses_service_flags() {
        let cli = Cli::try_parse_from([
            "vizhost", "service", "--port", "9000", "--channels", "2", "--fft-size", "4096",
        ])
        .unwrap();
        match cli.command {
            Commands::Service { port, audio, .. } => {
                assert_eq!(port, Some(9000));
                assert_eq!(audio.channels, Some(2));
                assert_eq!(audio.fft_size, Some(4096));
            }
            _ => panic!("Wrong command"),
        }
    }
}
