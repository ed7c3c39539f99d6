//! Admission control seen from the outside: at most N sessions are served
//! at once, later peers wait in the backlog until a slot frees.

mod common;

use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{base_config, start, Client};

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[test]
fn test_third_client_waits_until_a_slot_frees() {
    let mut config = base_config("third_waits");
    config.max_workers = 2;
    let mut running = start(config);

    let mut first = Client::connect(running.addr);
    first.welcome();
    let mut second = Client::connect(running.addr);
    second.welcome();

    let mut third = Client::connect(running.addr);
    third.set_read_timeout(Duration::from_millis(300));
    let waiting = third.try_line();
    assert!(
        matches!(&waiting, Err(e) if is_timeout(e.kind())),
        "third client was served early: {waiting:?}"
    );

    // Both admitted sessions keep working meanwhile.
    assert_eq!(second.echo("busy\n"), "busy\n");

    first.send("QUIT\n");
    assert!(first.closed());

    third.set_read_timeout(Duration::from_secs(10));
    assert!(third.welcome().starts_with("Hi! I'm an echo server."));
    assert_eq!(third.echo("finally\n"), "finally\n");

    second.send("QUIT\n");
    assert!(second.closed());
    third.send("QUIT\n");
    assert!(third.closed());

    let report = running.stop();
    assert!(report.is_success());
}

#[test]
fn test_concurrency_never_exceeds_limit() {
    const LIMIT: usize = 3;
    const CLIENTS: usize = 9;

    let mut config = base_config("never_exceeds");
    config.max_workers = LIMIT;
    let mut running = start(config);
    let addr = running.addr;

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let clients: Vec<_> = (0..CLIENTS)
        .map(|id| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                let mut client = Client::connect(addr);
                client.welcome();

                // Served from here until QUIT is sent.
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                for seq in 0..3 {
                    let message = format!("client {id} seq {seq}\n");
                    assert_eq!(client.echo(&message), message);
                    thread::sleep(Duration::from_millis(10));
                }

                active.fetch_sub(1, Ordering::SeqCst);
                client.send("QUIT\n");
                assert!(client.closed());
            })
        })
        .collect();

    for client in clients {
        client.join().expect("client panicked");
    }

    assert!(peak.load(Ordering::SeqCst) <= LIMIT);
    assert!(peak.load(Ordering::SeqCst) >= 1);

    let report = running.stop();
    assert!(report.is_success());
}

#[test]
fn test_pending_connection_dropped_on_stop() {
    let mut config = base_config("pending_dropped");
    config.max_workers = 1;
    config.grace = Duration::from_millis(200);
    let mut running = start(config);

    let mut served = Client::connect(running.addr);
    served.welcome();
    let mut pending = Client::connect(running.addr);

    // Give the dispatcher time to accept and start waiting for a slot.
    thread::sleep(Duration::from_millis(100));
    let report = running.stop();

    // The waiting peer never got a worker.
    assert!(pending.closed());
    assert_eq!(report.workers.abandoned, 1);
    drop(served);
}

#[cfg(target_os = "linux")]
#[test]
fn test_process_workers_share_the_limit() {
    use turnstile::core::{Admission, NamedAdmission};
    use turnstile::worker::WorkerMode;

    let name = format!("/turnstile_it_{}", std::process::id());
    let mut config = base_config("process_mode");
    config.mode = WorkerMode::Process;
    config.max_workers = 1;
    config.semaphore_name = name.clone();
    let mut running = start(config);

    let mut first = Client::connect(running.addr);
    first.welcome();
    assert_eq!(first.echo("from a child\n"), "from a child\n");

    let mut second = Client::connect(running.addr);
    second.set_read_timeout(Duration::from_millis(300));
    assert!(matches!(second.try_line(), Err(e) if is_timeout(e.kind())));

    first.send("QUIT\n");
    assert!(first.closed());

    second.set_read_timeout(Duration::from_secs(10));
    second.welcome();
    second.send("QUIT\n");
    assert!(second.closed());

    let report = running.stop();
    assert!(report.is_success());

    // Child records are relayed into the parent's log under the child's pid.
    let lines = running.log_lines();
    let parent = format!("[pid {}]", std::process::id());
    assert!(lines
        .iter()
        .any(|line| line.contains("Handling connection from") && !line.contains(&parent)));
    assert_eq!(report.records_written, Some(lines.len() as u64));

    // The name was unlinked on teardown: a fresh create starts at the limit.
    let again = NamedAdmission::create(&name, 1).unwrap();
    assert_eq!(again.available().unwrap(), 1);
    again.destroy().unwrap();
}

/// Pid of the first forked session found in the log, if any yet.
#[cfg(target_os = "linux")]
fn child_pid(lines: &[String]) -> Option<i32> {
    let parent = std::process::id() as i32;
    lines
        .iter()
        .filter(|line| line.contains("Handling connection from"))
        .filter_map(|line| {
            let rest = line.split("[pid ").nth(1)?;
            rest.split(']').next()?.parse::<i32>().ok()
        })
        .find(|&pid| pid != parent)
}

#[cfg(target_os = "linux")]
#[test]
fn test_killed_process_worker_frees_its_slot() {
    use std::time::Instant;
    use turnstile::worker::WorkerMode;

    let mut config = base_config("killed_worker");
    config.mode = WorkerMode::Process;
    config.max_workers = 1;
    config.semaphore_name = format!("/turnstile_kill_{}", std::process::id());
    let mut running = start(config);

    let mut first = Client::connect(running.addr);
    first.welcome();
    assert_eq!(first.echo("about to die\n"), "about to die\n");

    let deadline = Instant::now() + Duration::from_secs(5);
    let pid = loop {
        if let Some(pid) = child_pid(&running.log_lines()) {
            break pid;
        }
        assert!(Instant::now() < deadline, "no record from the child");
        thread::sleep(Duration::from_millis(20));
    };

    // SAFETY: plain syscall on the service's own child.
    assert_eq!(unsafe { libc::kill(pid, libc::SIGKILL) }, 0);
    assert!(first.closed());

    // The only slot comes back once the parent reaps the dead child.
    let mut second = Client::connect(running.addr);
    second.set_read_timeout(Duration::from_secs(10));
    assert!(second.welcome().starts_with("Hi! I'm an echo server."));
    assert_eq!(second.echo("next\n"), "next\n");
    second.send("QUIT\n");
    assert!(second.closed());

    let report = running.stop();
    assert!(report.is_success());
}
