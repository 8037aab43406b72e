//! Scheduler — the identity → agent-address registry service.
//!
//! Holds an in-memory table loaded from a flat JSON object on disk,
//! answers `Lookup`/`Ping` envelopes over TCP and hot-reloads the table
//! on SIGHUP. The table is a swappable immutable snapshot: file I/O and
//! parsing happen outside the lock, readers clone a cheap `Arc`, and a
//! reload installs a whole new map — a concurrent lookup sees the old
//! table or the new one, never a mix.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::wire::{self, SchedMsgType, SchedulerMsg};

/// Scheduler client calls use a fixed short timeout; agent calls have
/// their own configurable bound.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);

type Snapshot = Arc<HashMap<String, String>>;

/// File-backed registry of application identities to agent addresses.
pub struct RegistryStore {
    path: PathBuf,
    snapshot: RwLock<Snapshot>,
}

impl RegistryStore {
    /// Create an empty store bound to `path`. Call [`load`](Self::load)
    /// before serving; the scheduler cannot answer from an empty table.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Read the registry file and replace the table wholesale.
    ///
    /// On I/O or parse failure the previous table stays authoritative and
    /// the error is returned. Returns the entry count on success.
    pub fn load(&self) -> Result<usize, AppError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            AppError::Config(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let table: HashMap<String, String> = serde_json::from_str(&raw).map_err(|e| {
            AppError::Decode(format!("malformed registry {}: {e}", self.path.display()))
        })?;
        let count = table.len();

        let mut guard = self.snapshot.write().expect("registry lock poisoned");
        *guard = Arc::new(table);
        Ok(count)
    }

    /// Address registered for `app_id`, if any. Never touches the disk.
    pub fn lookup(&self, app_id: &str) -> Option<String> {
        self.current().get(app_id).cloned()
    }

    /// Cheap handle to the current table snapshot.
    pub fn current(&self) -> Snapshot {
        self.snapshot.read().expect("registry lock poisoned").clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ── service ───────────────────────────────────────────────────────────────

/// Run the scheduler: initial load, bind, SIGHUP reload task, accept loop.
///
/// Initial load and bind failures are fatal — the service cannot provide
/// its purpose without a table and a listening socket. Everything after
/// that survives bad input.
pub async fn serve(config: &Config, shutdown: CancellationToken) -> Result<(), AppError> {
    let store = Arc::new(RegistryStore::new(&config.scheduler_db_path));
    let count = store.load()?;
    info!(
        path = %config.scheduler_db_path.display(),
        entries = count,
        "registry loaded"
    );

    let addr = wire::listen_addr(&config.scheduler_listen)?;
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::Transport(format!("scheduler bind {addr}: {e}")))?;
    info!(%addr, "scheduler listening");

    spawn_reload_task(store.clone(), shutdown.clone());
    serve_listener(listener, store, shutdown).await;
    Ok(())
}

/// Accept loop over an already-bound listener. Public so tests can drive
/// the service on an ephemeral port with a pre-loaded store.
pub async fn serve_listener(
    listener: TcpListener,
    store: Arc<RegistryStore>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("scheduler shutting down");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "scheduler connection");
                        let store = store.clone();
                        let token = shutdown.clone();
                        tokio::spawn(handle_connection(stream, store, token));
                    }
                    Err(e) => warn!(error = %e, "scheduler accept error"),
                }
            }
        }
    }
}

/// Per-SIGHUP wholesale reload. Reload failure is logged and the previous
/// table remains authoritative; the task never takes the service down.
fn spawn_reload_task(store: Arc<RegistryStore>, shutdown: CancellationToken) {
    // Install the handler before spawning: a SIGHUP arriving between bind
    // and task start must not hit the default disposition.
    let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot install SIGHUP handler; registry reload disabled");
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = hup.recv() => {
                    info!(path = %store.path().display(), "SIGHUP received — reloading registry");
                    match store.load() {
                        Ok(count) => info!(entries = count, "registry reloaded"),
                        Err(e) => warn!(error = %e, "registry reload failed; keeping previous table"),
                    }
                }
            }
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    store: Arc<RegistryStore>,
    shutdown: CancellationToken,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            line = lines.next_line() => {
                match line {
                    Ok(None) => break,
                    Ok(Some(l)) if l.trim().is_empty() => continue,
                    Ok(Some(l)) => {
                        let reply = dispatch(&store, &l);
                        let mut frame = match serde_json::to_string(&reply) {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(error = %e, "scheduler reply encode error");
                                continue;
                            }
                        };
                        frame.push('\n');
                        if writer.write_all(frame.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "scheduler connection read error");
                        break;
                    }
                }
            }
        }
    }
}

/// Decode one request line and produce the reply envelope.
///
/// Malformed input yields an `Error` reply — a bad request must never
/// take the service down. Unhandled tags (including the reserved `Set`)
/// are answered `Unknown`.
pub fn dispatch(store: &RegistryStore, line: &str) -> SchedulerMsg {
    let query: SchedulerMsg = match serde_json::from_str(line) {
        Ok(q) => q,
        Err(e) => return SchedulerMsg::error(e.to_string()),
    };

    match query.msg_type {
        SchedMsgType::Lookup => match store.lookup(&query.app_id) {
            Some(address) => SchedulerMsg {
                address,
                app_id: query.app_id,
                ..SchedulerMsg::new(SchedMsgType::Reply)
            },
            None => SchedulerMsg {
                app_id: query.app_id,
                ..SchedulerMsg::new(SchedMsgType::NotFound)
            },
        },
        SchedMsgType::Ping => SchedulerMsg::new(SchedMsgType::PingReply),
        _ => SchedulerMsg::new(SchedMsgType::Unknown),
    }
}

// ── client helpers ────────────────────────────────────────────────────────

/// Ask the scheduler at `scheduler_address` for the agent address of
/// `app_id`. Not-found is a typed error distinct from transport faults.
pub async fn lookup_addr(scheduler_address: &str, app_id: &str) -> Result<String, AppError> {
    let reply: SchedulerMsg = wire::roundtrip(
        scheduler_address,
        &SchedulerMsg::lookup(app_id),
        LOOKUP_TIMEOUT,
    )
    .await?;

    match reply.msg_type {
        SchedMsgType::Reply => Ok(reply.address),
        SchedMsgType::NotFound => Err(AppError::NotFound(app_id.to_string())),
        _ => Err(AppError::Transport(non_empty_or(
            reply.error,
            "unexpected scheduler reply",
        ))),
    }
}

/// Liveness check against the scheduler.
pub async fn ping(scheduler_address: &str) -> Result<(), AppError> {
    let reply: SchedulerMsg = wire::roundtrip(
        scheduler_address,
        &SchedulerMsg::new(SchedMsgType::Ping),
        LOOKUP_TIMEOUT,
    )
    .await?;

    if reply.msg_type == SchedMsgType::PingReply {
        Ok(())
    } else {
        Err(AppError::Transport(non_empty_or(
            reply.error,
            "unexpected scheduler reply",
        )))
    }
}

fn non_empty_or(detail: String, fallback: &str) -> String {
    if detail.is_empty() {
        fallback.to_string()
    } else {
        detail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn registry_file(json: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    fn loaded_store(json: &str) -> (NamedTempFile, RegistryStore) {
        let f = registry_file(json);
        let store = RegistryStore::new(f.path());
        store.load().unwrap();
        (f, store)
    }

    #[test]
    fn load_and_lookup_roundtrip() {
        let (_f, store) = loaded_store(r#"{"alice": "tcp://host1:9924", "bob": "tcp://host2:9924"}"#);
        assert_eq!(store.lookup("alice").as_deref(), Some("tcp://host1:9924"));
        assert_eq!(store.lookup("bob").as_deref(), Some("tcp://host2:9924"));
        assert_eq!(store.lookup("carol"), None);
    }

    #[test]
    fn load_missing_file_fails_without_mutating() {
        let store = RegistryStore::new("/nonexistent/registry.json");
        assert!(store.load().is_err());
        assert!(store.current().is_empty());
    }

    #[test]
    fn reload_replaces_wholesale() {
        let mut f = registry_file(r#"{"alice": "tcp://host1:9924"}"#);
        let store = RegistryStore::new(f.path());
        store.load().unwrap();
        assert!(store.lookup("alice").is_some());

        // Rewrite the file with a disjoint table and reload.
        f.as_file_mut().set_len(0).unwrap();
        use std::io::Seek;
        f.as_file_mut().rewind().unwrap();
        f.write_all(br#"{"bob": "tcp://host9:9924"}"#).unwrap();
        f.flush().unwrap();

        store.load().unwrap();
        assert_eq!(store.lookup("alice"), None, "old entries must not survive");
        assert_eq!(store.lookup("bob").as_deref(), Some("tcp://host9:9924"));
    }

    #[test]
    fn failed_reload_keeps_previous_table() {
        let mut f = registry_file(r#"{"alice": "tcp://host1:9924"}"#);
        let store = RegistryStore::new(f.path());
        store.load().unwrap();

        f.as_file_mut().set_len(0).unwrap();
        use std::io::Seek;
        f.as_file_mut().rewind().unwrap();
        f.write_all(b"{ this is not json").unwrap();
        f.flush().unwrap();

        assert!(store.load().is_err());
        assert_eq!(store.lookup("alice").as_deref(), Some("tcp://host1:9924"));
    }

    #[test]
    fn snapshot_is_immutable_across_reload() {
        let mut f = registry_file(r#"{"alice": "a1"}"#);
        let store = RegistryStore::new(f.path());
        store.load().unwrap();

        let before = store.current();

        f.as_file_mut().set_len(0).unwrap();
        use std::io::Seek;
        f.as_file_mut().rewind().unwrap();
        f.write_all(br#"{"alice": "a2"}"#).unwrap();
        f.flush().unwrap();
        store.load().unwrap();

        // A reader holding the old snapshot still sees the old table whole.
        assert_eq!(before.get("alice").map(String::as_str), Some("a1"));
        assert_eq!(store.lookup("alice").as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn sighup_triggers_wholesale_reload() {
        let mut f = registry_file(r#"{"alice": "tcp://host1:9924"}"#);
        let store = Arc::new(RegistryStore::new(f.path()));
        store.load().unwrap();

        let shutdown = CancellationToken::new();
        spawn_reload_task(store.clone(), shutdown.clone());

        f.as_file_mut().set_len(0).unwrap();
        use std::io::Seek;
        f.as_file_mut().rewind().unwrap();
        f.write_all(br#"{"bob": "tcp://host9:9924"}"#).unwrap();
        f.flush().unwrap();

        // The handler is installed before spawn_reload_task returns, so the
        // signal cannot be lost; the reload itself is asynchronous.
        nix::sys::signal::kill(nix::unistd::getpid(), nix::sys::signal::Signal::SIGHUP).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.lookup("bob").is_none() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(store.lookup("bob").as_deref(), Some("tcp://host9:9924"));
        assert_eq!(store.lookup("alice"), None, "old entries must not survive");

        shutdown.cancel();
    }

    #[test]
    fn dispatch_lookup_found_and_not_found() {
        let (_f, store) = loaded_store(r#"{"alice": "tcp://host1:9924"}"#);

        let reply = dispatch(&store, r#"{"MsgType": 0, "AppID": "alice"}"#);
        assert_eq!(reply.msg_type, SchedMsgType::Reply);
        assert_eq!(reply.app_id, "alice");
        assert_eq!(reply.address, "tcp://host1:9924");

        let reply = dispatch(&store, r#"{"MsgType": 0, "AppID": "bob"}"#);
        assert_eq!(reply.msg_type, SchedMsgType::NotFound);
        assert_eq!(reply.app_id, "bob");
        assert_eq!(reply.address, "");
    }

    #[test]
    fn dispatch_ping_always_replies() {
        let (_f, store) = loaded_store("{}");
        let reply = dispatch(&store, r#"{"MsgType": 7}"#);
        assert_eq!(reply.msg_type, SchedMsgType::PingReply);
    }

    #[test]
    fn dispatch_reserved_set_is_unknown() {
        let (_f, store) = loaded_store("{}");
        let reply = dispatch(&store, r#"{"MsgType": 2, "AppID": "alice", "Address": "x"}"#);
        assert_eq!(reply.msg_type, SchedMsgType::Unknown);
    }

    #[test]
    fn dispatch_malformed_is_error_reply() {
        let (_f, store) = loaded_store("{}");
        let reply = dispatch(&store, "not json at all");
        assert_eq!(reply.msg_type, SchedMsgType::Error);
        assert!(!reply.error.is_empty());
    }
}
