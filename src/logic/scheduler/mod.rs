//! Background Scheduler
//!
//! Independent loops, one thread each: engine refresh, dump upload, archive
//! cleanup, command runner and the cron dispatcher. Loops log failures and
//! carry on at their next tick; all of them exit on the agent stop signal.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::{ARCHIVE_CLEAN_INTERVAL, ARCHIVE_EXPIRY, CRON_TICK, UPLOAD_INTERVAL};
use crate::logic::agent::Agent;
use crate::logic::commands::handle_manager_command;

pub mod cron;
pub mod poll;
pub mod upload;

pub use cron::CronDispatcher;
pub use poll::PollSchedule;

const STATS_INTERVAL: Duration = Duration::from_secs(5 * 60);
const TRACKER_GC_INTERVAL: Duration = Duration::from_secs(60);
const DUMP_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Start every loop enabled by the configuration
pub fn start(agent: &Arc<Agent>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let routines: [(&str, fn(&Agent) -> bool, fn(&Agent)); 4] = [
        ("update", update_enabled, update_routine),
        ("upload", upload_enabled, upload_routine),
        ("clean-archived", clean_archived_enabled, clean_archived_routine),
        ("command-runner", command_runner_enabled, command_runner_routine),
    ];

    for (name, enabled, routine) in routines {
        if !enabled(agent) {
            log::debug!("Routine {} disabled", name);
            continue;
        }
        handles.push(spawn(agent, name, routine));
    }
    handles.push(spawn(agent, "cron", cron_routine));

    handles
}

fn spawn(agent: &Arc<Agent>, name: &'static str, routine: fn(&Agent)) -> JoinHandle<()> {
    let agent = agent.clone();
    thread::spawn(move || {
        log::info!("Routine {} started", name);
        routine(&agent);
        log::info!("Routine {} stopped", name);
    })
}

// ============================================================================
// ENGINE REFRESH
// ============================================================================

fn update_interval(agent: &Agent) -> Duration {
    Duration::from_secs(agent.config().rules.update_interval_secs)
}

fn update_enabled(agent: &Agent) -> bool {
    agent.config().is_forwarding_enabled() && !update_interval(agent).is_zero()
}

fn update_routine(agent: &Agent) {
    let interval = update_interval(agent);
    while !agent.stop_signal().sleep(interval) {
        if let Err(e) = agent.update_engine(false) {
            log::error!("Failed to update detection engine: {}", e);
        }
    }
}

// ============================================================================
// DUMP UPLOAD
// ============================================================================

fn upload_enabled(agent: &Agent) -> bool {
    agent.config().is_dump_enabled() && agent.config().is_forwarding_enabled()
}

fn upload_routine(agent: &Agent) {
    let dump_dir = agent.config().dump.dir.clone();
    loop {
        let uploaded = upload::upload_dumps_once(&dump_dir, &**agent.client());
        if uploaded > 0 {
            log::info!("Uploaded {} dump files", uploaded);
        }
        if agent.stop_signal().sleep(UPLOAD_INTERVAL) {
            break;
        }
    }
}

// ============================================================================
// ARCHIVE CLEANUP
// ============================================================================

fn clean_archived_enabled(agent: &Agent) -> bool {
    agent.config().sysmon.clean_archived
}

fn clean_archived_routine(agent: &Agent) {
    let Some(dir) = agent.config().sysmon.archive_directory.clone() else {
        log::error!("Sysmon archive directory not configured");
        return;
    };
    if !dir.is_dir() {
        log::error!("No such Sysmon archive directory: {}", dir.display());
        return;
    }

    log::info!("Starting archive cleanup loop for directory: {}", dir.display());
    let mut reported = HashSet::new();
    loop {
        let removed = upload::clean_archived_once(&dir, ARCHIVE_EXPIRY, &mut reported);
        if removed > 0 {
            log::debug!("Removed {} archived files", removed);
        }
        if agent.stop_signal().sleep(ARCHIVE_CLEAN_INTERVAL) {
            break;
        }
    }
}

// ============================================================================
// COMMAND RUNNER
// ============================================================================

fn command_runner_enabled(agent: &Agent) -> bool {
    agent.config().is_forwarding_enabled()
}

/// Fetch, handle and answer one manager command; true if one was received
pub fn run_command_once(agent: &Agent) -> bool {
    let client = agent.client();
    match client.fetch_command() {
        Ok(Some(mut cmd)) => {
            log::info!("Handling command: {}", cmd);
            handle_manager_command(agent, &mut cmd);
            if let Err(e) = client.post_command(&cmd) {
                log::error!("Failed to post command result to manager: {}", e);
            }
            true
        }
        Ok(None) => false,
        Err(e) => {
            log::error!("Failed to fetch command from manager: {}", e);
            false
        }
    }
}

fn command_runner_routine(agent: &Agent) {
    let mut schedule = PollSchedule::default();
    loop {
        let received = run_command_once(agent);
        if agent.stop_signal().sleep(schedule.next_interval(received)) {
            break;
        }
    }
}

// ============================================================================
// CRON
// ============================================================================

/// Maintenance tasks multiplexed on the cron thread
pub fn maintenance_tasks() -> CronDispatcher<Agent> {
    let mut cron = CronDispatcher::new();
    cron.every("stats", STATS_INTERVAL, |agent: &Agent| agent.log_stats());
    cron.every("tracker-gc", TRACKER_GC_INTERVAL, |agent: &Agent| {
        let freed = agent.tracker().write().free_terminated();
        if freed > 0 {
            log::debug!("Freed {} terminated processes", freed);
        }
    });
    cron.every("dump-cleanup", DUMP_CLEANUP_INTERVAL, |agent: &Agent| {
        if agent.config().is_dump_enabled() {
            agent.remove_empty_dump_dirs();
        }
    });
    cron
}

fn cron_routine(agent: &Agent) {
    let mut cron = maintenance_tasks();
    log::debug!("Cron tasks: {}", cron.names().join(", "));
    while !agent.stop_signal().sleep(CRON_TICK) {
        if let Some(name) = cron.tick(agent, Instant::now()) {
            log::debug!("Cron task {} done", name);
        }
    }
}
