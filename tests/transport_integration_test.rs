//! End-to-end tests: a real daemon server and a real agent talking over a
//! Unix socket in a temporary directory.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use vdagent::daemon;
use vdagent::dispatch::messages::{encode_type_list, ClipboardType, Selection};
use vdagent::dispatch::{Clipboard, Dispatcher};
use vdagent::socket::framing::MessageType;
use vdagent::socket::marshal::{self, Destination, WriteHandle};
use vdagent::{Agent, AgentExit, Config};

// Config tests touch process-wide env vars
static ENV_LOCK: Mutex<()> = Mutex::new(());

type Grabs = Arc<Mutex<Vec<(Selection, Vec<u32>)>>>;

/// Clipboard that records grabs and raises quit on the first one.
struct RecordingClipboard {
    grabs: Grabs,
    quit: Arc<AtomicBool>,
}

impl Clipboard for RecordingClipboard {
    fn grab(&mut self, selection: Selection, types: &[u32]) {
        self.grabs.lock().unwrap().push((selection, types.to_vec()));
        self.quit.store(true, Ordering::Relaxed);
    }

    fn request(&mut self, _selection: Selection, _data_type: u32) -> bool {
        false
    }

    fn data(&mut self, _selection: Selection, _data_type: u32, _data: &[u8]) {}

    fn release(&mut self, _selection: Selection) {}

    fn release_all(&mut self) {}
}

fn agent_config(socket: &Path) -> Config {
    Config {
        socket_path: socket.to_path_buf(),
        max_connect_attempts: 20,
        retry_delay_ms: 50,
        ..Config::default()
    }
}

/// Start a poll-driven daemon thread. Returns the host-side write handle
/// and the join handle; the daemon stops when `stop` is set.
fn start_daemon(config: Config, version: &'static str, stop: Arc<AtomicBool>) -> (WriteHandle, thread::JoinHandle<()>) {
    let (handle_tx, handle_rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let mut server = daemon::bind(&config, None, version).unwrap();
        let (handle, mut mailbox) = marshal::channel(8).unwrap();
        handle_tx.send(handle).unwrap();
        daemon::run_poll(&mut server, Some(&mut mailbox), &stop).unwrap();
    });
    (handle_rx.recv().unwrap(), join)
}

#[test]
fn test_host_clipboard_grab_reaches_agent() {
    let dir = TempDir::new().unwrap();
    let config = agent_config(&dir.path().join("vdagentd.sock"));
    let stop = Arc::new(AtomicBool::new(false));
    let (host, daemon_thread) = start_daemon(config.clone(), "1.2.3", Arc::clone(&stop));

    let quit = Arc::new(AtomicBool::new(false));
    let grabs = Grabs::default();
    let dispatcher = Dispatcher::new("1.2.3").with_clipboard(Box::new(RecordingClipboard {
        grabs: Arc::clone(&grabs),
        quit: Arc::clone(&quit),
    }));
    let mut agent = Agent::new(config, dispatcher, Arc::clone(&quit)).unwrap();

    // The broadcast only lands once the agent is connected, so keep
    // offering until it has been seen.
    let sender = {
        let quit = Arc::clone(&quit);
        thread::spawn(move || {
            let types = encode_type_list(&[ClipboardType::Utf8Text, ClipboardType::Png]);
            while !quit.load(Ordering::Relaxed) {
                host.send_and_wait(
                    Destination::All,
                    MessageType::ClipboardGrab.as_u32(),
                    Selection::Primary.as_u32(),
                    0,
                    &types,
                )
                .unwrap();
                thread::sleep(Duration::from_millis(20));
            }
        })
    };

    assert_eq!(agent.run(), AgentExit::Quit);
    sender.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    daemon_thread.join().unwrap();

    let grabs = grabs.lock().unwrap();
    assert!(!grabs.is_empty());
    assert_eq!(
        grabs[0],
        (
            Selection::Primary,
            vec![ClipboardType::Utf8Text.as_u32(), ClipboardType::Png.as_u32()]
        )
    );
}

#[test]
fn test_agent_restarts_on_daemon_version_mismatch() {
    let dir = TempDir::new().unwrap();
    let config = agent_config(&dir.path().join("vdagentd.sock"));
    let stop = Arc::new(AtomicBool::new(false));
    let (_host, daemon_thread) = start_daemon(config.clone(), "9.9.9", Arc::clone(&stop));

    let mut agent = Agent::new(config, Dispatcher::new("1.0.0"), Arc::new(AtomicBool::new(false))).unwrap();
    assert_eq!(agent.run(), AgentExit::Restart);
    assert!(agent.version_mismatch());

    stop.store(true, Ordering::Relaxed);
    daemon_thread.join().unwrap();
}

#[test]
fn test_agent_waits_for_late_daemon() {
    let dir = TempDir::new().unwrap();
    let config = agent_config(&dir.path().join("late").join("vdagentd.sock"));
    let stop = Arc::new(AtomicBool::new(false));

    let late = {
        let config = config.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            let (host, daemon_thread) = start_daemon(config, "mismatch", stop);
            daemon_thread.join().unwrap();
            drop(host);
        })
    };

    let mut agent = Agent::new(config, Dispatcher::new("agent"), Arc::new(AtomicBool::new(false))).unwrap();
    assert_eq!(agent.run(), AgentExit::Restart);

    stop.store(true, Ordering::Relaxed);
    late.join().unwrap();
}

#[test]
fn test_config_load_reads_file_and_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        r#"{ "socket_path": "/run/from-file.sock", "max_connect_attempts": 5 }"#,
    )
    .unwrap();

    std::env::set_var("VDAGENT_CONFIG_DIR", dir.path());
    std::env::set_var("VDAGENT_DEBUG", "true");
    std::env::set_var("VDAGENT_SOCKET", "/run/from-env.sock");
    let loaded = Config::load();
    std::env::remove_var("VDAGENT_CONFIG_DIR");
    std::env::remove_var("VDAGENT_DEBUG");
    std::env::remove_var("VDAGENT_SOCKET");

    let (config, ignored) = loaded.unwrap();
    assert!(ignored.is_empty());
    assert_eq!(config.socket_path, Path::new("/run/from-env.sock"));
    assert_eq!(config.max_connect_attempts, 5);
    assert!(config.debug);
}
