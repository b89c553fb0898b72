//! Entry point for `x11-wire`.
//!
//! Parses CLI arguments and dispatches into **resolve** or **probe** mode.
//! All connection work is delegated to the library; `main.rs` owns only
//! process setup (logging, argument parsing) and the minimal unauthenticated
//! setup exchange `probe` needs before the engine can take over.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use x11_wire::address::{self, ParsedDisplay};
use x11_wire::transport::{PollMode, ReceiveStatus, SendStatus};
use x11_wire::{AsyncConnection, BufferWithFds, Connection, ConnectionConfig, DefaultStream, Transport};

/// Transport and request/reply core of an X11 client connection.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Print the socket address a display string resolves to.
    Resolve {
        /// Display string (defaults to $DISPLAY).
        display: Option<String>,
    },
    /// Connect, complete the setup exchange and time request round trips.
    Probe {
        /// Display string (defaults to $DISPLAY).
        #[arg(short, long)]
        display: Option<String>,
        /// Number of round trips.
        #[arg(short, long, default_value_t = 3)]
        count: u32,
        /// Give up on a reply after this many milliseconds.
        #[arg(short, long, default_value_t = 5000)]
        timeout_ms: u64,
        /// Largest single read from the socket.
        #[arg(long, default_value_t = 4096)]
        read_chunk_size: usize,
    },
}

/// `GetInputFocus`: the cheapest core request that has a reply.
const GET_INPUT_FOCUS: u8 = 43;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Resolve { display } => {
            let parsed = parse(display.as_deref())?;
            println!(
                "{} (display {}, screen {})",
                parsed.address, parsed.display, parsed.screen
            );
        }
        Mode::Probe {
            display,
            count,
            timeout_ms,
            read_chunk_size,
        } => {
            let parsed = parse(display.as_deref())?;
            let timeout = Duration::from_millis(timeout_ms);
            let config = ConnectionConfig {
                read_chunk_size,
                ..ConnectionConfig::default()
            };
            probe(&parsed, count, timeout, config).await?;
        }
    }
    Ok(())
}

fn parse(display: Option<&str>) -> Result<ParsedDisplay> {
    let parsed = match display {
        Some(d) => address::parse_display(d),
        None => address::from_env(),
    };
    parsed.context("cannot resolve display")
}

async fn probe(
    parsed: &ParsedDisplay,
    count: u32,
    timeout: Duration,
    config: ConnectionConfig,
) -> Result<()> {
    log::info!("connecting to {}", parsed.address);
    let stream = DefaultStream::connect(&parsed.address)
        .with_context(|| format!("cannot connect to {}", parsed.address))?;
    setup(&stream, timeout).context("connection setup failed")?;
    println!("connected to {}, setup accepted", parsed.address);

    let conn = AsyncConnection::new(Connection::with_config(stream, config));
    for _ in 0..count {
        let started = Instant::now();
        let seq = conn
            .send_request(BufferWithFds::from_bytes(get_input_focus()), true)?
            .context("request unexpectedly has no reply")?;
        match conn.wait_for_reply_timeout(seq, timeout).await? {
            Some(reply) if reply.is_error() => {
                println!("#{seq}: error {} in {:?}", reply.bytes()[1], started.elapsed())
            }
            Some(_) => println!("#{seq}: reply in {:?}", started.elapsed()),
            None => bail!("no reply to #{seq} within {timeout:?}"),
        }
    }

    let events = conn.connection().drain_events();
    if !events.is_empty() {
        println!("{} event(s) received meanwhile", events.len());
    }
    conn.shutdown()?;
    Ok(())
}

fn get_input_focus() -> Vec<u8> {
    let mut request = vec![GET_INPUT_FOCUS, 0, 0, 0];
    request[2..4].copy_from_slice(&1u16.to_ne_bytes());
    request
}

// ---------------------------------------------------------------------------
// Setup exchange (no authentication)
// ---------------------------------------------------------------------------

fn setup(stream: &DefaultStream, timeout: Duration) -> Result<()> {
    let byte_order = if cfg!(target_endian = "little") { b'l' } else { b'B' };
    let mut request = vec![byte_order, 0];
    request.extend(11u16.to_ne_bytes()); // protocol major
    request.extend(0u16.to_ne_bytes()); // protocol minor
    request.extend([0u8; 6]); // empty auth name and data, padding

    let deadline = Instant::now() + timeout;
    let mut out = BufferWithFds::from_bytes(request);
    while let SendStatus::WouldBlock { .. } = stream.send(&mut out)? {
        wait(stream, PollMode::Writable, deadline)?;
    }

    let head = read_exact(stream, 8, deadline)?;
    let extra = usize::from(u16::from_ne_bytes([head[6], head[7]])) * 4;
    let body = read_exact(stream, extra, deadline)?;

    match head[0] {
        1 => Ok(()),
        0 => {
            let len = usize::from(head[1]).min(body.len());
            bail!("refused: {}", String::from_utf8_lossy(&body[..len]).trim_end())
        }
        2 => bail!("server requires authentication"),
        other => bail!("unexpected setup status {other}"),
    }
}

fn read_exact(stream: &DefaultStream, len: usize, deadline: Instant) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(len);
    while bytes.len() < len {
        match stream.receive(len - bytes.len())? {
            ReceiveStatus::Data(chunk) => bytes.extend_from_slice(chunk.bytes()),
            ReceiveStatus::WouldBlock => wait(stream, PollMode::Readable, deadline)?,
        }
    }
    Ok(bytes)
}

fn wait(stream: &DefaultStream, mode: PollMode, deadline: Instant) -> Result<()> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() || !stream.poll(mode, Some(left))?.satisfies(mode) {
        bail!("timed out");
    }
    Ok(())
}
