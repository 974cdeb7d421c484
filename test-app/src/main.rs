// vrtlib test application -- CLI tool for listening to and sending
// VITA-49 streams over UDP and TCP.
//
// Usage:
//   vrtlib-test-app --host 239.1.2.3 --port 4991 listen --duration 30
//   vrtlib-test-app --transport tcp-server --port 5000 listen
//   vrtlib-test-app --host 127.0.0.1 --port 4991 -o VRL_FRAME=true send --count 100 --rate 50
//   vrtlib-test-app loopback --transport tcp --count 1000
//   vrtlib-test-app decode capture.bin --samples

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use tracing::{error, info, warn};

use vrtlib::io::{
    ChannelListener, InitialContext, ListenerEvent, VrtBuilder, VrtEvent, VrtListener,
};
use vrtlib::packet::payload::DataItemFormat;
use vrtlib::packet::{
    ContextBuilder, ContextFields, Packet, PacketBuilder, PayloadFormat, StreamDecoder,
    Timestamp, unpack_samples,
};
use vrtlib::{ConnectionOptions, TransportKind};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// vrtlib test application -- exercises readers and writers from the
/// command line.
#[derive(Parser)]
#[command(name = "vrtlib-test-app", version, about)]
struct Cli {
    /// Socket type.
    #[arg(long, value_enum, default_value_t = Transport::Udp)]
    transport: Transport,

    /// Remote host for senders and TCP clients; bind address or multicast
    /// group for listeners.
    #[arg(long, default_value = "")]
    host: String,

    /// Port number.
    #[arg(long, default_value_t = 4991)]
    port: u16,

    /// Extra connection option, e.g. `-o VRL_FRAME=true`. Repeatable.
    #[arg(short = 'o', long = "option", value_parser = parse_key_value)]
    options: Vec<(String, String)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Transport {
    Udp,
    TcpServer,
    TcpClient,
}

impl From<Transport> for TransportKind {
    fn from(t: Transport) -> Self {
        match t {
            Transport::Udp => TransportKind::Udp,
            Transport::TcpServer => TransportKind::TcpServer,
            Transport::TcpClient => TransportKind::TcpClient,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LoopbackTransport {
    Udp,
    Tcp,
}

#[derive(Subcommand)]
enum Command {
    /// Start a reader and log initial context, packets, warnings and errors.
    Listen {
        /// Seconds to listen; 0 runs until Ctrl-C.
        #[arg(long, default_value_t = 0)]
        duration: u64,

        /// Log every data packet instead of a once-per-second summary.
        #[arg(long)]
        verbose: bool,
    },

    /// Start a writer and send a context packet plus random-sample data.
    Send {
        /// Stream ID for both the context and data streams.
        #[arg(long, default_value_t = 1)]
        stream_id: u32,

        /// Number of data packets; 0 sends until Ctrl-C.
        #[arg(long, default_value_t = 100)]
        count: u64,

        /// Data packets per second.
        #[arg(long, default_value_t = 10.0)]
        rate: f64,

        /// Complex 16-bit samples per data packet.
        #[arg(long, default_value_t = 256)]
        samples: usize,

        /// Resend context after this many data packets.
        #[arg(long, default_value_t = 10)]
        context_every: u64,

        /// Advertised sample rate in Hz.
        #[arg(long, default_value_t = 1.0e6)]
        sample_rate: f64,
    },

    /// Send random packets to an in-process reader over loopback and check
    /// every payload arrives intact and in order.
    Loopback {
        #[arg(long, value_enum, default_value_t = LoopbackTransport::Udp)]
        transport: LoopbackTransport,

        #[arg(long, default_value_t = 1000)]
        count: u32,

        /// Payload octets per packet (rounded up to whole words).
        #[arg(long, default_value_t = 512)]
        size: usize,
    },

    /// Decode a raw capture of VRT packets and VRL frames.
    Decode {
        file: PathBuf,

        /// Print unpacked samples using the most recent context's payload format.
        #[arg(long)]
        samples: bool,
    },
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    Ok((k.trim().to_string(), v.trim().to_string()))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn builder(cli: &Cli) -> VrtBuilder {
    let mut b = VrtBuilder::new()
        .transport(cli.transport.into())
        .host(&cli.host)
        .port(cli.port);
    for (k, v) in &cli.options {
        b = b.option(k, v);
    }
    b
}

fn now_timestamp() -> Timestamp {
    let since = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp::utc(since.as_secs() as u32, u64::from(since.subsec_nanos()) * 1000)
}

fn random_iq(rng: &mut impl Rng, samples: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(samples * 4);
    for _ in 0..samples * 2 {
        let v: i16 = rng.gen_range(-8192..=8192);
        payload.extend_from_slice(&v.to_be_bytes());
    }
    payload
}

fn describe_context(ic: &InitialContext) -> String {
    let mut ids: Vec<u32> = ic.all_context.keys().copied().collect();
    ids.sort_unstable();
    let rate = ic
        .primary_context
        .as_ref()
        .and_then(|p| ContextFields::parse(p).ok())
        .and_then(|f| f.sample_rate);
    format!(
        "streams {ids:?}, data {:?}, sample rate {}",
        ic.paired_data.as_ref().and_then(Packet::stream_id),
        rate.map_or_else(|| "unknown".to_string(), |r| format!("{r} Hz"))
    )
}

// ---------------------------------------------------------------------------
// listen
// ---------------------------------------------------------------------------

/// Logs callbacks through `tracing` and keeps simple counters.
#[derive(Default)]
struct LogListener {
    verbose: bool,
    data: AtomicU64,
    octets: AtomicU64,
    context: AtomicU64,
}

impl VrtListener for LogListener {
    fn received_initial_context(&self, event: &VrtEvent, ic: &InitialContext) {
        match &ic.error_message {
            None => info!(source = %event.source, "Initial context: {}", describe_context(ic)),
            Some(msg) => warn!(source = %event.source, "Initial context incomplete: {msg} ({})", describe_context(ic)),
        }
    }

    fn received_data_packet(&self, event: &VrtEvent, packet: &Packet) {
        self.data.fetch_add(1, Ordering::Relaxed);
        self.octets.fetch_add(packet.len() as u64, Ordering::Relaxed);
        if self.verbose {
            info!(
                source = %event.source,
                stream = %packet.stream_code(),
                count = packet.packet_count(),
                bytes = packet.len(),
                "Data packet"
            );
        }
    }

    fn received_context_packet(&self, event: &VrtEvent, packet: &Packet) {
        self.context.fetch_add(1, Ordering::Relaxed);
        match ContextFields::parse(packet) {
            Ok(fields) => info!(
                source = %event.source,
                stream = %packet.stream_code(),
                sample_rate = ?fields.sample_rate,
                bandwidth = ?fields.bandwidth,
                rf = ?fields.rf_reference_frequency,
                "Context packet"
            ),
            Err(e) => warn!(source = %event.source, "Undecodable context packet: {e}"),
        }
    }

    fn received_packet(&self, event: &VrtEvent, packet: &Packet) {
        self.data.fetch_add(1, Ordering::Relaxed);
        self.octets.fetch_add(packet.len() as u64, Ordering::Relaxed);
        if self.verbose {
            info!(source = %event.source, stream = %packet.stream_code(), "Packet");
        }
    }

    fn error_occurred(&self, event: &VrtEvent, message: &str, cause: Option<&vrtlib::Error>) {
        match cause {
            Some(e) => error!(source = %event.source, "{message}: {e}"),
            None => error!(source = %event.source, "{message}"),
        }
    }

    fn warning_occurred(&self, event: &VrtEvent, message: &str, cause: Option<&vrtlib::Error>) {
        match cause {
            Some(e) => warn!(source = %event.source, "{message}: {e}"),
            None => warn!(source = %event.source, "{message}"),
        }
    }
}

async fn cmd_listen(cli: &Cli, duration_secs: u64, verbose: bool) -> Result<()> {
    let listener = Arc::new(LogListener {
        verbose,
        ..Default::default()
    });
    let reader = builder(cli)
        .listener(listener.clone())
        .build_reader()
        .await
        .context("failed to start reader")?;
    info!(addr = ?reader.local_addr(), "Listening (Ctrl-C to stop)");

    let deadline = (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut last = (0u64, 0u64);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tick.tick() => {
                let now = (listener.data.load(Ordering::Relaxed), listener.octets.load(Ordering::Relaxed));
                if !verbose && now != last {
                    info!(
                        packets = now.0 - last.0,
                        bytes = now.1 - last.1,
                        total = now.0,
                        context = listener.context.load(Ordering::Relaxed),
                        "Data in the last second"
                    );
                }
                last = now;
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    info!("Listen duration elapsed");
                    break;
                }
            }
        }
    }

    reader.stop(true).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// send
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn cmd_send(
    cli: &Cli,
    stream_id: u32,
    count: u64,
    rate: f64,
    samples: usize,
    context_every: u64,
    sample_rate: f64,
) -> Result<()> {
    if !(rate > 0.0) {
        bail!("--rate must be positive");
    }
    let writer = builder(cli)
        .build_writer()
        .await
        .context("failed to start writer")?;

    let format = PayloadFormat::new(DataItemFormat::SignedFixed, 16).complex();
    let context = |ts: Timestamp| {
        ContextBuilder::new(stream_id)
            .timestamp(ts)
            .sample_rate(sample_rate)
            .bandwidth(sample_rate * 0.8)
            .payload_format(format)
            .build()
    };

    let mut rng = rand::thread_rng();
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / rate));
    let start = Instant::now();
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {}
        }
        if count > 0 && sent >= count {
            break;
        }
        let ts = now_timestamp();
        let data = PacketBuilder::data(stream_id)
            .timestamp(ts)
            .payload(&random_iq(&mut rng, samples))
            .build()?;
        if context_every > 0 && sent % context_every == 0 {
            writer.send_packets(&[context(ts)?, data]).await?;
        } else {
            writer.send_packet(&data).await?;
        }
        sent += 1;
    }

    let elapsed = start.elapsed().as_secs_f64();
    info!(packets = sent, seconds = format!("{elapsed:.2}"), "Send finished");
    writer.stop(true).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// loopback
// ---------------------------------------------------------------------------

async fn cmd_loopback(transport: LoopbackTransport, count: u32, size: usize) -> Result<()> {
    let (reader_kind, writer_kind) = match transport {
        LoopbackTransport::Udp => (TransportKind::Udp, TransportKind::Udp),
        LoopbackTransport::Tcp => (TransportKind::TcpServer, TransportKind::TcpClient),
    };

    let (listener, mut events) = ChannelListener::new();
    let reader = VrtBuilder::new()
        .transport(reader_kind)
        .host("127.0.0.1")
        .port(0)
        .option("INITIAL_TIMEOUT", "5")
        .option("QUEUE_LIMIT_PACKETS", &(count as usize + 16).to_string())
        .listener(Arc::new(listener))
        .build_reader()
        .await?;
    let port = reader
        .local_addr()
        .context("reader has no local address")?
        .port();

    let writer = VrtBuilder::new()
        .transport(writer_kind)
        .host("127.0.0.1")
        .port(port)
        .vrl_frame(true, true)
        .build_writer()
        .await?;

    println!("Loopback test: {count} packets of {size} bytes over {transport:?} port {port}");

    let mut rng = rand::thread_rng();
    let words = size.div_ceil(4).max(1);
    let mut expected = Vec::with_capacity(count as usize);
    let start = Instant::now();

    writer
        .send_packet(&ContextBuilder::new(1).sample_rate(1e6).build()?)
        .await?;
    for _ in 0..count {
        let payload: Vec<u8> = (0..words * 4).map(|_| rng.r#gen()).collect();
        let packet = PacketBuilder::data(1).payload(&payload).build()?;
        writer.send_packet(&packet).await?;
        expected.push(payload);
        // UDP on loopback still drops under bursts; pace lightly.
        if matches!(transport, LoopbackTransport::Udp) {
            tokio::task::yield_now().await;
        }
    }

    let mut received = Vec::with_capacity(count as usize);
    let mut warnings = 0u32;
    let mut errors = 0u32;
    while received.len() < expected.len() {
        let event = match tokio::time::timeout(Duration::from_secs(3), events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => break,
        };
        match event {
            ListenerEvent::InitialContext(ic) => {
                if let Some(msg) = &ic.error_message {
                    eprintln!("initial context incomplete: {msg}");
                    errors += 1;
                }
                if let Some(p) = ic.paired_data {
                    received.push(p.payload().to_vec());
                }
            }
            ListenerEvent::DataPacket(p) => received.push(p.payload().to_vec()),
            ListenerEvent::Warning { message, .. } => {
                eprintln!("warning: {message}");
                warnings += 1;
            }
            ListenerEvent::Error { message, cause } => {
                eprintln!("error: {message} {}", cause.unwrap_or_default());
                errors += 1;
            }
            _ => {}
        }
    }
    let elapsed = start.elapsed();

    writer.stop(true).await?;
    reader.stop(true).await?;

    let intact = expected
        .iter()
        .zip(&received)
        .filter(|(a, b)| a == b)
        .count();
    let missing = expected.len().saturating_sub(received.len());
    let corrupt = received.len().min(expected.len()) - intact;
    let rate = if elapsed.as_secs_f64() > 0.0 {
        received.len() as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };

    println!();
    println!("Results:");
    println!("  Sent:           {count}");
    println!("  Intact:         {intact}");
    println!("  Missing:        {missing}");
    println!("  Out of order:   {corrupt}");
    println!("  Warnings:       {warnings}");
    println!("  Errors:         {errors}");
    println!("  Elapsed:        {:.3} s", elapsed.as_secs_f64());
    println!("  Rate:           {rate:.1} packets/sec");

    if intact != count as usize {
        bail!("{} out of {count} packets did not arrive intact", count as usize - intact);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------------

fn cmd_decode(file: &Path, show_samples: bool) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let mut decoder = StreamDecoder::new();
    decoder.push(&bytes);

    let mut format: Option<PayloadFormat> = None;
    let (mut frames, mut packets, mut errors) = (0usize, 0usize, 0usize);
    loop {
        let unit = match decoder.next_unit() {
            Ok(Some(unit)) => unit,
            Ok(None) => break,
            Err(e) => {
                println!("!! {e}");
                errors += 1;
                continue;
            }
        };
        if let Some(fc) = unit.frame_count() {
            frames += 1;
            println!("frame {fc} ({} bytes, {} packets)", unit.wire_len(), unit.packets().len());
        }
        for p in unit.packets() {
            packets += 1;
            println!(
                "  {} count={} bytes={} ts={:?}",
                p.stream_code(),
                p.packet_count(),
                p.len(),
                p.timestamp()
            );
            if p.is_context() {
                if let Ok(fields) = ContextFields::parse(p) {
                    format = fields.payload_format.or(format);
                    println!("    {fields:?}");
                }
            } else if show_samples {
                let fmt = format.unwrap_or_default();
                match unpack_samples(&fmt, p.payload()) {
                    Ok(s) => println!("    samples[..8] = {:?}", &s[..s.len().min(8)]),
                    Err(e) => println!("    samples: {e}"),
                }
            }
        }
    }

    println!();
    println!("{frames} frames, {packets} packets, {errors} errors, {} trailing bytes", decoder.pending());
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // Surface bad -o pairs before any socket is opened.
    let mut check = ConnectionOptions::default();
    for (k, v) in &cli.options {
        check.apply(k, v).with_context(|| format!("option {k}={v}"))?;
    }

    match &cli.command {
        Command::Listen { duration, verbose } => cmd_listen(&cli, *duration, *verbose).await,
        Command::Send {
            stream_id,
            count,
            rate,
            samples,
            context_every,
            sample_rate,
        } => {
            cmd_send(&cli, *stream_id, *count, *rate, *samples, *context_every, *sample_rate).await
        }
        Command::Loopback {
            transport,
            count,
            size,
        } => cmd_loopback(*transport, *count, *size).await,
        Command::Decode { file, samples } => cmd_decode(file, *samples),
    }
}
