//! turnstile server binary
//!
//! Usage:
//!   cargo run --release --bin turnstile -- [OPTIONS]
//!
//! Every option can also come from a `TURNSTILE_*` environment variable or
//! a `.env` file; see `--help`.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use turnstile::config::{Cli, ServerConfig, SinkKind};
use turnstile::signals::SignalListener;
use turnstile::telemetry::init_tracing;
use turnstile::Service;

fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = ServerConfig::try_from(cli).context("invalid configuration")?;

    // Before any thread exists, so every thread inherits the mask.
    let signals = SignalListener::install().context("cannot block termination signals")?;

    print_banner(&config);

    let service = Service::bind(config).context("cannot start service")?;
    let stats = service.stats();
    let signal_thread = signals
        .spawn(service.shutdown_handle())
        .context("cannot start signal thread")?;

    println!("🔌 Listening on {}", service.local_addr());
    println!("\n📡 Waiting for connections... (Ctrl-C to stop)\n");

    let started = std::time::Instant::now();
    let report = service.run();
    signal_thread.stop();

    stats.print_stats(started.elapsed());
    println!(
        "\n🛑 Stopped ({}): {} workers finished, {} terminated, {} abandoned",
        report.reason,
        report.workers.completed,
        report.workers.terminated,
        report.workers.abandoned
    );
    if let Some(written) = report.records_written {
        println!("   Log records:   {written}");
    }
    for err in &report.errors {
        eprintln!("⚠️ {err}");
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_banner(config: &ServerConfig) {
    println!("🚦 TURNSTILE - bounded-concurrency echo server");
    println!("==============================================\n");
    println!(
        "👷 Workers:    at most {} ({} mode)",
        config.max_workers, config.mode
    );
    println!(
        "🔚 Terminator: {:?} ({} framing)",
        config.session.terminator, config.session.framing
    );
    match config.log.sink {
        SinkKind::File => println!(
            "💾 Log:        {} (buffer {} records)",
            config.log.path.display(),
            config.log.capacity
        ),
        SinkKind::Journal => println!(
            "💾 Journal:    {} ({} KB, buffer {} records)",
            config.log.path.display(),
            config.log.journal_size / 1024,
            config.log.capacity
        ),
        SinkKind::None => println!("💾 Log:        disabled"),
    }
}
