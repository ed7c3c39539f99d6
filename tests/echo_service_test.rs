//! End-to-end echo sessions over loopback TCP
//!
//! Usage:
//!   cargo test --test echo_service_test

mod common;

use std::io::{Read, Write};
use std::time::Duration;

use common::{base_config, start, Client};
use turnstile::config::SinkKind;
use turnstile::core::MmapJournal;
use turnstile::protocol::Framing;
use turnstile::StopReason;

#[test]
fn test_hello_then_quit() {
    let mut running = start(base_config("hello_quit"));
    let mut client = Client::connect(running.addr);

    let local = client.local_addr();
    assert_eq!(
        client.welcome(),
        format!(
            "Hi! I'm an echo server. You are 127.0.0.1 talking on port {}.\n\
             I will send you back whatever you send me. I will stop if you send me QUIT :-)\n",
            local.port()
        )
    );

    assert_eq!(client.echo("hello\n"), "hello\n");
    client.send("QUIT\n");
    assert!(client.closed());

    let report = running.stop();
    assert!(report.is_success());
    assert_eq!(report.reason, StopReason::Requested);
}

#[test]
fn test_only_exact_terminator_closes() {
    let mut running = start(base_config("exact_terminator"));
    let mut client = Client::connect(running.addr);
    client.welcome();

    for message in ["QUI\n", "QUITTER\n", "please QUIT\n", "quit\n", "\n"] {
        assert_eq!(client.echo(message), message);
    }
    client.send("QUIT\r\n");
    assert!(client.closed());

    running.stop();
}

#[test]
fn test_echo_is_byte_for_byte() {
    let mut running = start(base_config("byte_exact"));
    let mut client = Client::connect(running.addr);
    client.welcome();

    let messages = [
        "tab\tseparated\n",
        "unicode \u{00e9}\u{4e16}\u{1f980}\n",
        "trailing spaces   \n",
        "crlf kept\r\n",
    ];
    for message in messages {
        assert_eq!(client.echo(message), message);
    }
    let long = format!("{}\n", "x".repeat(1000));
    assert_eq!(client.echo(&long), long);

    client.send("QUIT\n");
    assert!(client.closed());
    running.stop();
}

#[test]
fn test_oversized_line_closes_only_that_session() {
    let mut config = base_config("oversized");
    config.session.max_frame = 64;
    let mut running = start(config);

    let mut greedy = Client::connect(running.addr);
    greedy.welcome();
    greedy.send(&"y".repeat(200));
    assert!(greedy.closed());

    let mut polite = Client::connect(running.addr);
    polite.welcome();
    assert_eq!(polite.echo("still here\n"), "still here\n");
    polite.send("QUIT\n");
    assert!(polite.closed());

    running.stop();
}

#[test]
fn test_raw_framing_echoes_each_read() {
    let mut config = base_config("raw_framing");
    config.session.framing = Framing::Raw;
    let mut running = start(config);

    let mut client = Client::connect(running.addr);
    client.welcome();
    assert_eq!(client.echo("abc\n"), "abc\n");

    // Terminator without a line ending is an exact match in raw mode.
    client.send("QUIT");
    assert!(client.closed());
    running.stop();
}

#[test]
fn test_log_records_session_lifecycle() {
    let mut config = base_config("lifecycle_log");
    config.session.log_messages = true;
    let mut running = start(config);

    let mut client = Client::connect(running.addr);
    let local = client.local_addr();
    client.welcome();
    client.echo("one\n");
    client.send("QUIT\n");
    assert!(client.closed());

    let report = running.stop();
    let lines = running.log_lines();

    let expect = [
        format!("Server listening on {}", running.addr),
        format!("Incoming connection accepted from {local}"),
        format!("Handling connection from 127.0.0.1 on port {}", local.port()),
        format!("Echoed 4 bytes to {local}"),
        format!("Connection from {local} terminated after 1 messages"),
        "Shutting down (requested)".to_string(),
    ];
    for wanted in &expect {
        assert!(
            lines.iter().any(|line| line.ends_with(wanted.as_str())),
            "missing record {wanted:?} in {lines:#?}"
        );
    }

    let pid = format!("[pid {}]", std::process::id());
    assert!(lines.iter().all(|line| line.contains(&pid)));
    assert_eq!(report.records_written, Some(lines.len() as u64));
}

#[test]
fn test_log_file_is_appended_across_runs() {
    let config = base_config("append_runs");
    let path = config.log.path.clone();

    let mut first = start(config.clone());
    first.stop();
    let after_first = std::fs::read_to_string(&path).unwrap().lines().count();
    assert!(after_first >= 2);

    let mut second = start(config);
    second.stop();
    let after_second = std::fs::read_to_string(&path).unwrap().lines().count();
    assert_eq!(after_second, after_first * 2);
}

#[test]
fn test_journal_sink_holds_records() {
    let mut config = base_config("journal_sink");
    config.log.sink = SinkKind::Journal;
    config.log.journal_size = 64 * 1024;
    let mut running = start(config);

    let mut client = Client::connect(running.addr);
    client.welcome();
    client.send("QUIT\n");
    assert!(client.closed());
    running.stop();

    let journal = MmapJournal::open(&running.log_path, 64 * 1024).unwrap();
    let text = String::from_utf8(journal.contents()).unwrap();
    assert!(text.contains("Incoming connection accepted from 127.0.0.1:"));
    assert!(text.ends_with("Shutting down (requested)\n"));
}

#[test]
fn test_teardown_report_is_stable() {
    let mut running = start(base_config("stable_report"));

    let first = running.stop();
    assert_eq!(running.shutdown.report(), Some(first.clone()));

    // A late trigger changes nothing.
    assert!(!running.shutdown.trigger(StopReason::Fatal("late".into())));
    assert_eq!(running.shutdown.report(), Some(first));
}

#[test]
fn test_peer_disconnect_mid_session() {
    let mut running = start(base_config("peer_disconnect"));

    {
        let mut client = Client::connect(running.addr);
        client.welcome();
        client.echo("bye without quitting\n");
    }

    // The slot freed by the vanished peer is usable again.
    let mut next = Client::connect(running.addr);
    next.welcome();
    next.send("QUIT\n");
    assert!(next.closed());

    let report = running.stop();
    assert!(report.is_success());
}

#[test]
fn test_stop_with_idle_listener_is_prompt() {
    let mut running = start(base_config("idle_stop"));
    let started = std::time::Instant::now();
    running.stop();
    assert!(started.elapsed() < Duration::from_secs(2));

    // Listener is closed after teardown.
    let refused = std::net::TcpStream::connect_timeout(&running.addr, Duration::from_millis(500));
    if let Ok(mut stream) = refused {
        // Some kernels accept into a dying backlog; nothing may be served.
        let mut buf = [0u8; 1];
        stream.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let _ = stream.write_all(b"x");
        assert!(!matches!(stream.read(&mut buf), Ok(n) if n > 0));
    }
}
