//! Sub-command parsing and execution for the `webfleet` binary.
//!
//! Deliberately hand-rolled: the command surface is small and fixed, and
//! the parser is a single match over the first words of the argument list.

use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent;
use crate::config::Config;
use crate::error::AppError;
use crate::scheduler;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parse and execute one CLI invocation. `args` excludes the binary name.
pub async fn run(config: &Config, args: &[String]) -> Result<(), AppError> {
    let words: Vec<&str> = args.iter().map(String::as_str).collect();

    match words.as_slice() {
        [] | ["help", ..] => {
            print_help();
            Ok(())
        }
        ["version"] => {
            println!("webfleet version {VERSION}");
            Ok(())
        }
        ["ping", "scheduler"] => do_ping_scheduler(config).await,
        ["ping", "agent", addr] => do_ping_agent(config, addr).await,
        ["ping", ..] => usage("webfleet ping scheduler | webfleet ping agent <address>"),
        ["scheduler", "lookup"] => do_lookup(config, &config.app_id).await,
        ["scheduler", "lookup", app_id] => do_lookup(config, app_id).await,
        ["scheduler", ..] => usage("webfleet scheduler lookup [appid]"),
        ["start"] => print_action(agent::start_app(config, &config.app_id).await),
        ["stop"] => print_action(agent::stop_app(config, &config.app_id).await),
        ["ps"] => print_action(agent::ps(config, &config.app_id).await),
        ["kill", pid] => match pid.parse::<u32>() {
            Ok(pid) => print_action(agent::kill_pid(config, &config.app_id, pid).await),
            Err(e) => usage(&format!("webfleet kill <pid>: {e}")),
        },
        ["kill", ..] => usage("webfleet kill <pid>"),
        ["serve", rest @ ..] => {
            let services = serve_list(config, rest);
            serve(config, &services).await
        }
        [other, ..] => {
            eprintln!("webfleet: unknown command: {other}");
            eprintln!("Run 'webfleet help' for usage information.");
            Err(AppError::Config(format!("unknown command '{other}'")))
        }
    }
}

fn usage(text: &str) -> Result<(), AppError> {
    eprintln!("Usage: {text}");
    Err(AppError::Config("invalid arguments".into()))
}

fn print_help() {
    print!(
        "Webfleet is an automation tool for running operator commands on content servers.\n\
         \n\
         Usage:\n\
         webfleet command <required arguments> [optional arguments]\n\
         \n\
         The commands are:\n\
         \x20 help                     - Display this text\n\
         \x20 kill <pid>               - Kill PID on content server under this account\n\
         \x20 ping scheduler           - Display status of the scheduler\n\
         \x20 ping agent <address>     - Display status of the agent at address\n\
         \x20 ps                       - Display processes on content server under this account\n\
         \x20 scheduler lookup [appid] - Query scheduler for the agent address of an app\n\
         \x20 serve [services]         - Run the named services (scheduler, agent)\n\
         \x20 start                    - Execute ~/bin/start on content server under this account\n\
         \x20 stop                     - Execute ~/bin/stop on content server under this account\n\
         \x20 version                  - Display the webfleet version\n\
         \n\
         Environment variables, default in brackets:\n\
         WF_SCHEDULER_ADDRESS - Scheduler connect address [tcp://localhost:9912]\n\
         WF_APP_ID            - Application identifier [current username]\n\
         WF_SCHEDULER_DB_PATH - Registry JSON file [/usr/local/etc/webfleet/scheduler.json]\n\
         WF_SCHEDULER_LISTEN  - Scheduler listen endpoint [tcp://*:9912]\n\
         WF_AGENT_LISTEN      - Agent listen endpoint [tcp://*:9924]\n\
         WF_AGENT_TIMEOUT     - Agent request timeout in seconds [30]\n\
         WF_MODE              - Comma-separated services for 'serve' []\n\
         WF_LOG_LEVEL         - Log level [info]\n"
    );
}

async fn do_ping_scheduler(config: &Config) -> Result<(), AppError> {
    match scheduler::ping(&config.scheduler_address).await {
        Ok(()) => {
            println!("Scheduler is alive.");
            Ok(())
        }
        Err(e) => {
            println!("Scheduler is not responding. [{e}]");
            Err(e)
        }
    }
}

async fn do_ping_agent(config: &Config, addr: &str) -> Result<(), AppError> {
    let timeout = Duration::from_secs(config.agent_timeout_secs);
    match agent::ping(addr, timeout).await {
        Ok(()) => {
            println!("Agent at {addr} is alive.");
            Ok(())
        }
        Err(e) => {
            println!("Agent at {addr} is not responding. [{e}]");
            Err(e)
        }
    }
}

async fn do_lookup(config: &Config, app_id: &str) -> Result<(), AppError> {
    match scheduler::lookup_addr(&config.scheduler_address, app_id).await {
        Ok(addr) => {
            println!("The agent for AppID={app_id} is at {addr}");
            Ok(())
        }
        Err(e) => {
            // Not-found, timeout and transport failures read differently.
            match &e {
                AppError::NotFound(_) => println!("No agent is registered for AppID={app_id}"),
                AppError::Timeout => println!("Scheduler lookup timed out for AppID={app_id}"),
                other => println!("Scheduler lookup failed for AppID={app_id}: {other}"),
            }
            Err(e)
        }
    }
}

fn print_action(result: Result<String, AppError>) -> Result<(), AppError> {
    match result {
        Ok(output) => {
            if !output.is_empty() {
                print!("{output}");
                if !output.ends_with('\n') {
                    println!();
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{e}");
            Err(e)
        }
    }
}

// ── services ──────────────────────────────────────────────────────────────

fn serve_list(config: &Config, rest: &[&str]) -> Vec<String> {
    if rest.is_empty() {
        config.mode.clone()
    } else {
        rest.iter()
            .flat_map(|w| w.split(','))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Run the named services until SIGTERM/Ctrl-C. A fatal startup failure
/// in any service cancels the rest and propagates.
async fn serve(config: &Config, services: &[String]) -> Result<(), AppError> {
    if services.is_empty() {
        return Err(AppError::Config(
            "no services named; set WF_MODE or run 'webfleet serve scheduler,agent'".into(),
        ));
    }

    let shutdown = CancellationToken::new();
    let mut set: JoinSet<Result<(), AppError>> = JoinSet::new();

    for name in services {
        let cfg = config.clone();
        let token = shutdown.clone();
        match name.as_str() {
            "scheduler" => {
                set.spawn(async move { scheduler::serve(&cfg, token).await });
            }
            "agent" => {
                set.spawn(async move { agent::serve(&cfg, token).await });
            }
            other => {
                shutdown.cancel();
                return Err(AppError::Config(format!("unknown service '{other}'")));
            }
        }
    }

    spawn_signal_watcher(shutdown.clone());

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                shutdown.cancel();
                first_error.get_or_insert(e);
            }
            Err(e) => {
                shutdown.cancel();
                first_error.get_or_insert(AppError::Config(format!("service task failed: {e}")));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn spawn_signal_watcher(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot install SIGTERM handler");
                    return;
                }
            };
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received — shutting down"),
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!("ctrl-c received — shutting down");
                }
            }
        }
        shutdown.cancel();
    });
}
