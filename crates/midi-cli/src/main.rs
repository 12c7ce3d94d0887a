use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use midi_device::driver::OutputHandler;
use midi_device::{
    native_driver, InputDevice, MidiDriver, NativeDriver, OutputDevice, OutputEvent, Session, ShimConfig,
    TickGenerator,
};
use midi_protocol::identity::DeviceDescriptor;
use midi_protocol::short::ShortMessage;

mod args;

#[derive(Parser, Debug)]
#[command(name = "midinspect", about = "Inspect and exercise native MIDI devices")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $MIDI_NATIVE_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List input and output devices
    List {
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send one message to an output device
    Send {
        /// Output index or name
        device: String,
        /// Message bytes in hex, e.g. `90 3C 7F` or `F0 7E 7F 06 01 F7`
        #[arg(required = true, num_args = 1..)]
        bytes: Vec<String>,
    },
    /// Print everything an input device receives until Ctrl-C
    Monitor {
        /// Input index or name
        device: String,
        /// Stop after this many events
        #[arg(long)]
        count: Option<usize>,
    },
    /// Run the tick generator and report its timing
    Clock {
        /// Tick interval in milliseconds
        interval_ms: u64,
        /// Number of ticks to measure
        #[arg(long, default_value_t = 20)]
        ticks: usize,
        /// Also send MIDI timing clock (0xF8) to this output on every tick
        #[arg(long)]
        output: Option<String>,
    },
}

#[derive(Serialize)]
struct Listing<'a> {
    api: String,
    can_compare_devices: bool,
    inputs: &'a [DeviceDescriptor],
    outputs: &'a [DeviceDescriptor],
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ShimConfig::load(path)?,
        None => ShimConfig::from_env()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let driver = native_driver();
    info!(api = ?driver.api_type(), "MIDI driver ready");
    let session = Session::open(driver, &config.session.name, None)?;

    match args.command {
        Commands::List { json } => list(&session, json)?,
        Commands::Send { device, bytes } => {
            let bytes = args::parse_bytes(&bytes)?;
            let target = args::find_device(&session.outputs(), &device)?;
            send(&session, &target, bytes).await?;
        }
        Commands::Monitor { device, count } => {
            let source = args::find_device(&session.inputs(), &device)?;
            monitor(&session, &source, &config, count).await?;
        }
        Commands::Clock {
            interval_ms,
            ticks,
            output,
        } => {
            let target = output
                .map(|query| args::find_device(&session.outputs(), &query))
                .transpose()?;
            clock(&session, &config, interval_ms, ticks, target.as_ref()).await?;
        }
    }

    Ok(())
}

fn list(session: &Session<NativeDriver>, json: bool) -> anyhow::Result<()> {
    let inputs = session.inputs();
    let outputs = session.outputs();

    if json {
        let listing = Listing {
            api: format!("{:?}", session.api_type()),
            can_compare_devices: session.can_compare_devices(),
            inputs: &inputs,
            outputs: &outputs,
        };
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    println!("MIDI devices ({:?})", session.api_type());
    println!("══════════════════════════════");
    for (title, devices) in [("Inputs", &inputs), ("Outputs", &outputs)] {
        println!("  {}:", title);
        if devices.is_empty() {
            println!("    none");
        }
        for d in devices {
            let mut line = format!("    [{}] {}", d.index, d.name);
            if let Some(manufacturer) = &d.manufacturer {
                line.push_str(&format!(" ({})", manufacturer));
            }
            if let Some(version) = d.driver_version_string() {
                line.push_str(&format!(" (driver {})", version));
            }
            println!("{}", line);
        }
    }
    Ok(())
}

async fn send(session: &Session<NativeDriver>, target: &DeviceDescriptor, bytes: Vec<u8>) -> anyhow::Result<()> {
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let handler: OutputHandler = Box::new(move |event: OutputEvent| {
        let OutputEvent::SysExDone(ticket) = event;
        let _ = done_tx.send(ticket);
    });
    let mut output = OutputDevice::open(session, target, handler)?;

    if bytes.first() == Some(&0xF0) {
        let size = bytes.len();
        let ticket = output.send_sysex(bytes)?;
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(done) = done_rx.recv().await {
                if done == ticket {
                    break;
                }
            }
        })
        .await
        .context("SysEx transfer did not complete")?;
        output.complete_sysex(ticket)?;
        println!("Sent {} SysEx bytes to {}", size, target.name);
    } else {
        let message = ShortMessage::from_bytes(&bytes);
        if bytes.len() != message.encoded_len() {
            warn!(given = bytes.len(), sent = message.encoded_len(), "Byte count does not match status");
        }
        output.send_short(message)?;
        println!("Sent {:?} to {}", &message.bytes().0[..message.encoded_len()], target.name);
    }

    output.close()?;
    Ok(())
}

async fn monitor(
    session: &Session<NativeDriver>,
    source: &DeviceDescriptor,
    config: &ShimConfig,
    count: Option<usize>,
) -> anyhow::Result<()> {
    let (mut input, consumer) = InputDevice::open_with_channel(
        session,
        source,
        config.input.sysex_buffer_size,
        config.input.channel_capacity(),
        config.input.slot_size,
    )?;
    input.connect()?;
    println!("Monitoring {} (Ctrl-C to stop)", source.name);

    let mut buf = vec![0u8; consumer.slot_size()];
    let mut seen = 0usize;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            received = consumer.pop(&mut buf) => {
                let data = &buf[..received.len];
                println!(
                    "{:>14}  {}{}",
                    received.timestamp,
                    args::format_bytes(data),
                    if received.truncated { " …" } else { "" }
                );
                seen += 1;
                if count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
            _ = &mut ctrl_c => break,
        }
    }

    input.close()?;
    info!(events = seen, "Monitor stopped");
    Ok(())
}

async fn clock(
    session: &Session<NativeDriver>,
    config: &ShimConfig,
    interval_ms: u64,
    ticks: usize,
    target: Option<&DeviceDescriptor>,
) -> anyhow::Result<()> {
    let mut output = target
        .map(|d| OutputDevice::open(session, d, Box::new(|_: OutputEvent| {})))
        .transpose()?;

    let (tick_tx, mut tick_rx) = tokio::sync::mpsc::unbounded_channel();
    let generator = TickGenerator::start(
        Duration::from_millis(interval_ms),
        move || {
            if let Some(output) = output.as_mut() {
                if let Err(e) = output.send_short(0xF8u32) {
                    warn!(error = %e, "Failed to send timing clock");
                }
            }
            let _ = tick_tx.send(Instant::now());
        },
        &config.tick,
    )?;

    let mut stamps = Vec::with_capacity(ticks + 1);
    while stamps.len() <= ticks {
        match tick_rx.recv().await {
            Some(stamp) => stamps.push(stamp),
            None => break,
        }
    }
    generator.stop()?;

    let interval = Duration::from_millis(interval_ms);
    let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
    let Some(report) = args::GapReport::new(&gaps, interval) else {
        println!("No ticks measured");
        return Ok(());
    };

    println!("Tick generator ({} ms, {:?})", interval_ms, config.tick.strategy);
    println!("══════════════════════════════");
    println!("  Gaps:   {}", gaps.len());
    println!("  Min:    {:.3} ms", report.min.as_secs_f64() * 1000.0);
    println!("  Mean:   {:.3} ms", report.mean.as_secs_f64() * 1000.0);
    println!("  Max:    {:.3} ms", report.max.as_secs_f64() * 1000.0);
    println!("  Early:  {}", report.early);
    Ok(())
}
