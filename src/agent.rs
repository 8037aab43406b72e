//! Execution agent — runs operator commands on behalf of an application
//! account.
//!
//! The agent listens on its own endpoint and executes one of four fixed
//! command categories per request: start app, stop app, list processes,
//! kill pid. Each request names an OS account; the command runs with that
//! account's privilege, never broader.
//!
//! Privilege is narrowed through an explicit [`ExecContext`] handed to the
//! child-process launcher — the agent process itself never changes its
//! effective uid or working directory, so there is no ambient state to
//! restore between requests. On Linux the drop is delegated to
//! `/usr/sbin/runuser`; elsewhere the child's uid/gid are set pre-exec.
//!
//! Command execution is strictly single-flight: connections are accepted
//! concurrently (an idle socket never holds the listener), but requests
//! queue behind one execution gate so commands never interleave. A hung
//! `bin/start` therefore still blocks the queue — a known limit of the
//! protocol, kept deliberately (clients carry their own timeout).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::User;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::scheduler;
use crate::wire::{self, AgentMsg, AgentMsgType};

// ── service ───────────────────────────────────────────────────────────────

/// Run the agent service.
///
/// Precondition: the process must run with effective uid 0 — it cannot
/// attribute commands to arbitrary accounts otherwise. Checked once at
/// startup, fatal; never per request.
pub async fn serve(config: &Config, shutdown: CancellationToken) -> Result<(), AppError> {
    if !nix::unistd::geteuid().is_root() {
        return Err(AppError::Config("agent must be run as root".into()));
    }

    let addr = wire::listen_addr(&config.agent_listen)?;
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::Transport(format!("agent bind {addr}: {e}")))?;
    info!(%addr, "agent listening");

    serve_listener(listener, shutdown).await;
    Ok(())
}

/// Accept loop over an already-bound listener. Each connection gets its
/// own task, but all of them share one execution gate — command
/// execution must never interleave, while an idle connection must never
/// starve the listener. Public so tests can drive the loop on an
/// ephemeral port without the root precondition.
pub async fn serve_listener(listener: TcpListener, shutdown: CancellationToken) {
    let gate = Arc::new(Mutex::new(()));
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("agent shutting down");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "agent connection");
                        tokio::spawn(handle_connection(stream, gate.clone(), shutdown.clone()));
                    }
                    Err(e) => warn!(error = %e, "agent accept error"),
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, gate: Arc<Mutex<()>>, shutdown: CancellationToken) {
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
                        let reply = {
                            // One command in flight across all connections.
                            let _running = gate.lock().await;
                            dispatch(&l).await
                        };
                        let mut frame = match serde_json::to_string(&reply) {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(error = %e, "agent reply encode error");
                                continue;
                            }
                        };
                        frame.push('\n');
                        if writer.write_all(frame.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "agent connection read error");
                        break;
                    }
                }
            }
        }
    }
}

/// Decode one request line, perform the action, produce the reply.
///
/// A successful action echoes the request tag with the captured output in
/// `MsgData`. Any failure turns the tag into `Error` with the detail in
/// `Error` — partial output, when captured, still travels in `MsgData`.
pub async fn dispatch(line: &str) -> AgentMsg {
    let query: AgentMsg = match serde_json::from_str(line) {
        Ok(q) => q,
        Err(e) => return AgentMsg::error(e.to_string()),
    };

    let outcome = match query.msg_type {
        AgentMsgType::Ping => return AgentMsg::new(AgentMsgType::PingReply),
        AgentMsgType::StartApp => start_app_local(&query.app_id).await,
        AgentMsgType::StopApp => stop_app_local(&query.app_id).await,
        AgentMsgType::Ps => ps_local(&query.app_id).await,
        AgentMsgType::KillPid => kill_pid_local(&query.app_id, &query.msg_data).await,
        // PingReply and reserved tags are not valid requests.
        _ => Outcome::fail(AppError::Decode("malformed agent request".into())),
    };

    let mut reply = AgentMsg::new(query.msg_type);
    reply.msg_data = outcome.output;
    if let Some(failure) = outcome.failure {
        reply.msg_type = AgentMsgType::Error;
        reply.error = failure.to_string();
    }
    reply
}

// ── actions ───────────────────────────────────────────────────────────────

/// Captured output plus failure, if any. Output is kept even on failure.
struct Outcome {
    output: String,
    failure: Option<AppError>,
}

impl Outcome {
    fn fail(e: AppError) -> Self {
        Self {
            output: String::new(),
            failure: Some(e),
        }
    }
}

async fn start_app_local(app_id: &str) -> Outcome {
    app_command(app_id, "bin/start").await
}

async fn stop_app_local(app_id: &str) -> Outcome {
    app_command(app_id, "bin/stop").await
}

async fn app_command(app_id: &str, argv0: &str) -> Outcome {
    let account = match resolve_account(app_id) {
        Ok(u) => u,
        Err(e) => return Outcome::fail(e),
    };
    let home = account.dir.clone();
    run(&ExecContext {
        account,
        argv: vec![argv0.to_string()],
        dir: Some(home),
    })
    .await
}

async fn ps_local(app_id: &str) -> Outcome {
    let account = match resolve_account(app_id) {
        Ok(u) => u,
        Err(e) => return Outcome::fail(e),
    };
    run(&platform::ps_context(account)).await
}

async fn kill_pid_local(app_id: &str, pid_text: &str) -> Outcome {
    let account = match resolve_account(app_id) {
        Ok(u) => u,
        Err(e) => return Outcome::fail(e),
    };
    // The pid travels as text; reject anything that is not a bare pid
    // before it reaches a command line.
    let pid = match pid_text.trim().parse::<u32>() {
        Ok(p) if p > 0 => p,
        _ => {
            return Outcome::fail(AppError::Decode(format!("invalid pid '{pid_text}'")));
        }
    };
    run(&ExecContext {
        account,
        argv: vec!["/bin/kill".to_string(), pid.to_string()],
        dir: None,
    })
    .await
}

/// Each identity must map to exactly one pre-existing OS account of the
/// same name. Absence is a request-level error, never a crash.
fn resolve_account(app_id: &str) -> Result<User, AppError> {
    if app_id.is_empty() {
        return Err(AppError::Account("empty app id".into()));
    }
    User::from_name(app_id)
        .map_err(|e| AppError::Account(format!("lookup '{app_id}': {e}")))?
        .ok_or_else(|| AppError::Account(format!("no such account '{app_id}'")))
}

// ── execution ─────────────────────────────────────────────────────────────

/// Immutable description of one command run: which account, which argv,
/// which working directory. The launcher consumes it without mutating any
/// process-wide state.
struct ExecContext {
    account: User,
    argv: Vec<String>,
    dir: Option<PathBuf>,
}

/// Launch the command described by `ctx` and capture combined
/// stdout+stderr. Spawn failures and non-zero exits both surface as
/// execution errors; captured output survives either way.
async fn run(ctx: &ExecContext) -> Outcome {
    let mut cmd = platform::build_command(ctx);
    if let Some(dir) = &ctx.dir {
        cmd.current_dir(dir);
    }

    let cmdline = ctx.argv.join(" ");
    debug!(account = %ctx.account.name, command = %cmdline, "running command");

    let output = match cmd.output().await {
        Ok(o) => o,
        Err(e) => {
            return Outcome::fail(AppError::Execution(format!("{cmdline}: {e}")));
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    let failure = if output.status.success() {
        None
    } else {
        Some(AppError::Execution(format!("{cmdline}: {}", output.status)))
    };
    Outcome {
        output: combined,
        failure,
    }
}

#[cfg(target_os = "linux")]
mod platform {
    //! Delegated-elevation variant: `/usr/sbin/runuser` performs the
    //! privilege drop; the agent never touches its own identity.

    use super::{Command, ExecContext, User};

    pub(super) fn build_command(ctx: &ExecContext) -> Command {
        let mut cmd = Command::new("/usr/sbin/runuser");
        cmd.arg("-").arg(&ctx.account.name).args(&ctx.argv);
        cmd
    }

    pub(super) fn ps_context(account: User) -> ExecContext {
        let home = account.dir.clone();
        ExecContext {
            argv: vec![
                "/bin/ps".to_string(),
                "-U".to_string(),
                account.name.clone(),
                "u".to_string(),
            ],
            account,
            dir: Some(home),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    //! Direct variant: narrow the child's uid/gid pre-exec when the target
    //! account differs from our own. The parent's identity is untouched.

    use super::{Command, ExecContext, User};

    pub(super) fn build_command(ctx: &ExecContext) -> Command {
        let mut cmd = Command::new(&ctx.argv[0]);
        cmd.args(&ctx.argv[1..]);
        if ctx.account.uid != nix::unistd::geteuid() {
            cmd.uid(ctx.account.uid.as_raw());
            cmd.gid(ctx.account.gid.as_raw());
        }
        cmd
    }

    pub(super) fn ps_context(account: User) -> ExecContext {
        ExecContext {
            argv: vec![
                "/bin/ps".to_string(),
                "-U".to_string(),
                account.name.clone(),
                "-f".to_string(),
                "-x".to_string(),
            ],
            account,
            dir: None,
        }
    }
}

// ── client helpers ────────────────────────────────────────────────────────

/// Start `~/bin/start` for `app_id` on its content server. Resolves the
/// agent address through the scheduler first.
pub async fn start_app(config: &Config, app_id: &str) -> Result<String, AppError> {
    request_action(config, AgentMsgType::StartApp, app_id, "").await
}

/// Stop via `~/bin/stop`.
pub async fn stop_app(config: &Config, app_id: &str) -> Result<String, AppError> {
    request_action(config, AgentMsgType::StopApp, app_id, "").await
}

/// List the account's processes on its content server.
pub async fn ps(config: &Config, app_id: &str) -> Result<String, AppError> {
    request_action(config, AgentMsgType::Ps, app_id, "").await
}

/// Kill `pid` on the content server, attributed to `app_id`.
pub async fn kill_pid(config: &Config, app_id: &str, pid: u32) -> Result<String, AppError> {
    request_action(config, AgentMsgType::KillPid, app_id, &pid.to_string()).await
}

/// Liveness check against an explicit agent address.
pub async fn ping(agent_address: &str, timeout: Duration) -> Result<(), AppError> {
    let reply: AgentMsg =
        wire::roundtrip(agent_address, &AgentMsg::new(AgentMsgType::Ping), timeout).await?;
    if reply.msg_type == AgentMsgType::PingReply {
        Ok(())
    } else {
        Err(AppError::Transport(if reply.error.is_empty() {
            "unexpected agent reply".to_string()
        } else {
            reply.error
        }))
    }
}

async fn request_action(
    config: &Config,
    msg_type: AgentMsgType,
    app_id: &str,
    msg_data: &str,
) -> Result<String, AppError> {
    let agent_addr = scheduler::lookup_addr(&config.scheduler_address, app_id).await?;
    let reply: AgentMsg = wire::roundtrip(
        &agent_addr,
        &AgentMsg::request(msg_type, app_id, msg_data),
        Duration::from_secs(config.agent_timeout_secs),
    )
    .await?;

    if reply.msg_type == msg_type {
        Ok(reply.msg_data)
    } else {
        let mut detail = if reply.error.is_empty() {
            "unexpected agent reply".to_string()
        } else {
            reply.error
        };
        if !reply.msg_data.is_empty() {
            detail.push('\n');
            detail.push_str(&reply.msg_data);
        }
        Err(AppError::Execution(detail))
    }
}
