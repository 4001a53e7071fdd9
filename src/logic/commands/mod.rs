//! Manager Command Dispatch
//!
//! Commands fetched from the manager are routed by name to local handlers.
//! Handlers either answer in place (marking the command unrunnable) or bind
//! it to an OS process. Unknown names run as literal processes.

use std::path::Path;

use sysinfo::{Pid, System};

use crate::logic::agent::Agent;

pub mod command;
pub mod containment;
pub mod fs;
pub mod report;

pub use command::{Command, CommandError};

// ============================================================================
// PROCESS ACTIONS
// ============================================================================

/// Kill a process by PID
pub fn terminate_process(pid: u32) -> Result<(), CommandError> {
    let mut sys = System::new();
    sys.refresh_processes();
    let process = sys
        .process(Pid::from_u32(pid))
        .ok_or(CommandError::ProcessNotFound { pid })?;
    if process.kill() {
        Ok(())
    } else {
        Err(CommandError::KillFailed { pid })
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

fn arg(cmd: &Command, index: usize) -> Result<String, String> {
    cmd.args
        .get(index)
        .cloned()
        .ok_or_else(|| format!("{}: missing argument {}", cmd.name, index + 1))
}

/// Fill in a command received from the manager, then execute it
pub fn handle_manager_command(agent: &Agent, cmd: &mut Command) {
    match cmd.name.as_str() {
        "contain" => match agent.client().manager_ip() {
            Some(ip) => containment::contain(cmd, ip),
            None => {
                cmd.unrunnable();
                cmd.set_error("cannot contain host: manager address unknown");
            }
        },
        "uncontain" => containment::uncontain(cmd),
        "osquery" => {
            let osquery = &agent.config().report.osquery;
            if osquery.is_available() {
                let mut args = vec!["--json".to_string(), "-A".to_string()];
                args.extend(cmd.args.iter().cloned());
                cmd.from_exec(&osquery.bin.to_string_lossy(), args);
                cmd.expect_json = true;
            } else {
                cmd.unrunnable();
                cmd.set_error(format!(
                    "OSQuery binary file configured does not exist: {}",
                    osquery.bin.display()
                ));
            }
        }
        "terminate" => {
            cmd.unrunnable();
            let result = arg(cmd, 0).and_then(|pid| {
                pid.parse::<u32>()
                    .map_err(|e| format!("invalid pid {}: {}", pid, e))
            });
            match result {
                Ok(pid) if pid == agent.pid() => cmd.set_error("refusing to terminate the agent"),
                Ok(pid) => {
                    if let Some(track) = agent.tracker().read().get_by_pid(pid) {
                        log::info!("Terminating tracked process {} ({})", pid, track.image);
                    }
                    if let Err(e) = terminate_process(pid) {
                        cmd.set_error(e);
                    }
                }
                Err(e) => cmd.set_error(e),
            }
        }
        "hash" => {
            cmd.unrunnable();
            cmd.expect_json = true;
            let result = arg(cmd, 0).and_then(|p| fs::hash(Path::new(&p)).map_err(|e| e.to_string()));
            cmd.set_result(result);
        }
        "stat" => {
            cmd.unrunnable();
            cmd.expect_json = true;
            let result = arg(cmd, 0).and_then(|p| fs::stat(Path::new(&p)).map_err(|e| e.to_string()));
            cmd.set_result(result);
        }
        "dir" => {
            cmd.unrunnable();
            cmd.expect_json = true;
            let result = arg(cmd, 0).and_then(|p| fs::dir(Path::new(&p)).map_err(|e| e.to_string()));
            cmd.set_result(result);
        }
        "walk" => {
            cmd.unrunnable();
            cmd.expect_json = true;
            let result = arg(cmd, 0).and_then(|p| fs::walk(Path::new(&p)).map_err(|e| e.to_string()));
            cmd.set_result(result);
        }
        "find" => {
            cmd.unrunnable();
            cmd.expect_json = true;
            let result = arg(cmd, 0)
                .and_then(|root| arg(cmd, 1).map(|pattern| (root, pattern)))
                .and_then(|(root, pattern)| fs::find(Path::new(&root), &pattern));
            cmd.set_result(result);
        }
        "report" => {
            cmd.unrunnable();
            cmd.expect_json = true;
            cmd.set_result::<_, String>(Ok(agent.report(false)));
        }
        "processes" => {
            cmd.unrunnable();
            cmd.expect_json = true;
            let ps = agent.tracker().read().ps();
            cmd.set_result::<_, String>(Ok(ps));
        }
        "drivers" => {
            cmd.unrunnable();
            cmd.expect_json = true;
            let drivers = agent.tracker().read().drivers().to_vec();
            cmd.set_result::<_, String>(Ok(drivers));
        }
        _ => {}
    }

    if let Err(e) = cmd.run() {
        log::error!("failed to run command sent by manager \"{}\": {}", cmd, e);
    }
}
