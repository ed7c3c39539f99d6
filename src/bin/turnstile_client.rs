//! turnstile load client
//!
//! Opens K concurrent sessions against a turnstile server; each sends
//! numbered lines at a fixed interval, checks every echo, then sends the
//! terminator.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin turnstile_client -- --host 127.0.0.1:2015 --threads 10
//! ```

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "turnstile_client", version, about = "Concurrent load client for turnstile")]
struct ClientArgs {
    /// Server address.
    #[arg(long, env = "TURNSTILE_CLIENT_HOST", default_value = "127.0.0.1:2015")]
    host: String,

    /// Concurrent sessions (K).
    #[arg(short = 'k', long, default_value_t = 10)]
    threads: usize,

    /// Messages per session before the terminator.
    #[arg(short = 'm', long, default_value_t = 20)]
    messages: u64,

    /// Pause between messages, in milliseconds.
    #[arg(short, long, default_value_t = 100)]
    interval_ms: u64,

    /// Terminator token the server expects.
    #[arg(long, default_value = "QUIT")]
    terminator: String,

    /// Print every echo.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

/// Round-trip statistics shared by every session.
#[derive(Default)]
struct RoundTrips {
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
    /// Time from connect until the welcome arrived, summed over sessions.
    admission_wait_us: AtomicU64,
}

impl RoundTrips {
    fn record(&self, rtt: Duration) {
        let us = rtt.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    fn print_report(&self, sessions: usize, elapsed: Duration) {
        let count = self.count.load(Ordering::Relaxed);
        let avg = if count > 0 {
            self.sum_us.load(Ordering::Relaxed) as f64 / count as f64
        } else {
            0.0
        };
        let wait = self.admission_wait_us.load(Ordering::Relaxed) as f64 / sessions.max(1) as f64;

        println!("\n📊 Client Summary");
        println!("   Duration:        {:.2}s", elapsed.as_secs_f64());
        println!("   Echoes:          {count}");
        println!("   Avg round trip:  {avg:.1} µs");
        println!("   Max round trip:  {} µs", self.max_us.load(Ordering::Relaxed));
        println!("   Avg admission:   {:.1} ms", wait / 1000.0);
    }
}

fn run_session(id: usize, args: &ClientArgs, stats: &RoundTrips) -> anyhow::Result<()> {
    let connected = Instant::now();
    let stream = TcpStream::connect(&args.host)
        .with_context(|| format!("session {id}: cannot connect to {}", args.host))?;
    stream.set_nodelay(true)?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();

    // Two-line welcome; it only arrives once a worker slot is free.
    for _ in 0..2 {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            bail!("session {id}: server closed before the welcome message");
        }
    }
    stats
        .admission_wait_us
        .fetch_add(connected.elapsed().as_micros() as u64, Ordering::Relaxed);

    let pause = Duration::from_millis(args.interval_ms);
    for seq in 0..args.messages {
        let message = format!("session {id} message {seq}\n");
        let sent = Instant::now();
        writer.write_all(message.as_bytes())?;

        line.clear();
        if reader.read_line(&mut line)? == 0 {
            bail!("session {id}: connection closed after {seq} messages");
        }
        stats.record(sent.elapsed());

        if line != message {
            bail!("session {id}: echo mismatch, sent {message:?} got {line:?}");
        }
        if args.verbose {
            print!("   [{id}] {line}");
        }
        thread::sleep(pause);
    }

    writer.write_all(format!("{}\n", args.terminator).as_bytes())?;
    line.clear();
    // Server closes after the terminator; anything else is unexpected.
    if reader.read_line(&mut line)? != 0 {
        bail!("session {id}: unexpected data after terminator: {line:?}");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Arc::new(ClientArgs::parse());

    println!("🦀 TURNSTILE CLIENT");
    println!("===================\n");
    println!("   Server:     {}", args.host);
    println!("   Sessions:   {}", args.threads);
    println!(
        "   Messages:   {} per session, every {} ms\n",
        args.messages, args.interval_ms
    );

    let stats = Arc::new(RoundTrips::default());
    let started = Instant::now();

    let sessions: Vec<_> = (0..args.threads)
        .map(|id| {
            let args = Arc::clone(&args);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name(format!("client-{id}"))
                .spawn(move || run_session(id, &args, &stats))
        })
        .collect::<Result<_, _>>()
        .context("cannot start client threads")?;

    let mut failures = 0;
    for handle in sessions {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                eprintln!("❌ {err:#}");
                failures += 1;
            }
            Err(_) => {
                eprintln!("❌ client thread panicked");
                failures += 1;
            }
        }
    }

    stats.print_report(args.threads, started.elapsed());
    if failures > 0 {
        bail!("{failures} of {} sessions failed", args.threads);
    }
    println!("\n✅ All sessions completed");
    Ok(())
}
