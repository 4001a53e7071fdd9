//! Built-in Hooks
//!
//! Light bookkeeping hooks always run before detection since the self-event
//! filter depends on them. Post-detection hooks are only registered when
//! hooks are enabled.

use serde_json::{json, Value};

use super::dump;
use super::HookManager;
use crate::logic::agent::Agent;
use crate::logic::commands::{containment, terminate_process};
use crate::logic::config::Config;
use crate::logic::event::{paths, Event};
use crate::logic::tracker::{DriverInfo, ProcessTrack};

// ============================================================================
// REGISTRATION
// ============================================================================

pub fn register_pre_hooks(hooks: &mut HookManager) {
    hooks.hook("self-guid", flt_has_process_id, hook_self_guid);
    hooks.hook("proc-term", Event::is_process_terminate, hook_proc_term);
    hooks.hook("track", flt_track, hook_track);
}

pub fn register_post_hooks(hooks: &mut HookManager, config: &Config) {
    if config.endpoint {
        if config.dump.is_mode_enabled("file") {
            hooks.hook("dump-file", flt_detection, dump::hook_dump_file);
        }
        for mode in ["registry", "memory"] {
            if config.dump.is_mode_enabled(mode) {
                log::warn!("Dump mode {} is not supported by this agent, ignoring", mode);
            }
        }
    }

    // Score must be set before actions run
    hooks.hook("update-score", flt_detection, hook_update_score);
    hooks.hook("handle-actions", flt_detection, hook_handle_actions);
}

// ============================================================================
// FILTERS
// ============================================================================

fn flt_has_process_id(event: &Event) -> bool {
    event.process_id().is_some() && event.process_guid().is_some()
}

fn flt_track(event: &Event) -> bool {
    event.is_process_create() || event.is_process_terminate() || event.is_driver_load()
}

fn flt_detection(event: &Event) -> bool {
    event.get(paths::DETECTION_SIGNATURE).is_some()
}

// ============================================================================
// PRE-DETECTION
// ============================================================================

/// Learn the agent's own process GUID from telemetry about itself or about
/// a process it created
fn hook_self_guid(agent: &Agent, event: &mut Event) {
    if !agent.guid().is_empty() {
        return;
    }

    let guid = if event.process_id() == Some(agent.pid()) {
        event.process_guid()
    } else if event.is_process_create() && event.parent_process_id() == Some(agent.pid()) {
        event.parent_process_guid()
    } else {
        None
    };

    if let Some(guid) = guid.filter(|g| !g.is_empty()) {
        log::info!("Agent process GUID: {}", guid);
        agent.set_guid(&guid);
    }
}


fn hook_proc_term(agent: &Agent, _event: &mut Event) {
    agent.mark_proc_term_seen();
}

fn hook_track(agent: &Agent, event: &mut Event) {
    if event.is_process_create() {
        if let Some(track) = ProcessTrack::from_event(event) {
            agent.tracker().write().add(track);
        }
    } else if event.is_process_terminate() {
        if let Some(guid) = event.process_guid() {
            agent.tracker().write().terminate(&guid);
        }
    } else if event.is_driver_load() {
        if let Some(driver) = DriverInfo::from_event(event) {
            agent.tracker().write().add_driver(driver);
        }
    }
}

// ============================================================================
// POST-DETECTION
// ============================================================================

/// Accumulate criticality per process and annotate the event with it
fn hook_update_score(agent: &Agent, event: &mut Event) {
    let Some(guid) = event.process_guid() else { return };
    let criticality = event.get_i64(paths::DETECTION_CRITICALITY).unwrap_or_default();

    let score = {
        let mut tracker = agent.tracker().write();
        match tracker.get_by_guid_mut(&guid) {
            Some(track) => {
                track.score += criticality;
                track.score
            }
            None => criticality,
        }
    };
    event.set(paths::DETECTION_SCORE, json!(score));
}

fn hook_handle_actions(agent: &Agent, event: &mut Event) {
    let actions: Vec<String> = match event.get(paths::DETECTION_ACTIONS) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|a| a.as_str().map(str::to_lowercase))
            .collect(),
        _ => return,
    };

    for action in actions {
        match action.as_str() {
            "kill" => kill_process(agent, event),
            "contain" => contain_host(agent),
            "report" => log_report(agent, event),
            other => log::debug!("Unhandled rule action: {}", other),
        }
    }
}

fn kill_process(agent: &Agent, event: &Event) {
    let Some(pid) = event.process_id() else { return };
    if pid == agent.pid() || agent.is_self_event(event) {
        return;
    }
    if agent.is_dry_run() {
        log::info!("Dry run: would terminate process {}", pid);
        return;
    }
    match terminate_process(pid) {
        Ok(()) => log::warn!("Terminated process {} ({})", pid, event.image().unwrap_or_default()),
        Err(e) => log::error!("Failed to terminate process {}: {}", pid, e),
    }
}

fn log_report(agent: &Agent, event: &Event) {
    let report = agent.report(true);
    match serde_json::to_string(&report) {
        Ok(json) => log::info!(
            "Report for alert on {}: {}",
            event.process_guid().unwrap_or_default(),
            json
        ),
        Err(e) => log::error!("Failed to serialize report: {}", e),
    }
}

fn contain_host(agent: &Agent) {
    let Some(ip) = agent.client().manager_ip() else {
        log::error!("Cannot contain host: manager address unknown");
        return;
    };
    if agent.is_dry_run() {
        log::info!("Dry run: would contain host around {}", ip);
        return;
    }
    let mut cmd = containment::contain_command(ip);
    if let Err(e) = cmd.run() {
        log::error!("Failed to contain host: {}", e);
    }
}
