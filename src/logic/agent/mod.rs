//! Detection Agent
//!
//! Owns every piece of shared state: the active detection engine behind a
//! reader/writer lock, the hook managers, the activity tracker, the
//! forwarder and the counters. The ingestion thread holds the engine read
//! lock per event; rebuilds hold the write lock for the whole construction
//! so no event is ever matched against a half-loaded engine.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use walkdir::WalkDir;

use crate::constants::HOOK_SEMAPHORE_SIZE;
use crate::logic::commands::report::Report;
use crate::logic::commands::Command;
use crate::logic::compress::Compressor;
use crate::logic::config::{self, Config, ConfigError};
use crate::logic::engine::{DetectionEngine, EngineError, EngineFactory};
use crate::logic::event::Event;
use crate::logic::forwarder::{EventSink, FileSink, Forwarder, ManagerSink};
use crate::logic::hooks::{builtin, HookManager};
use crate::logic::manager::{HttpManagerClient, LocalClient, ManagerClient};
use crate::logic::scheduler;
use crate::logic::semaphore::Semaphore;
use crate::logic::signal::{StopSignal, WaitGroup};
use crate::logic::source::{EventSource, JsonLinesSource, SourceInput, SubscribeMode};
use crate::logic::sync::RuleSync;
use crate::logic::tracker::ActivityTracker;

mod ingest;

pub use ingest::Outcome;


// ============================================================================
// DEPENDENCIES
// ============================================================================

/// Collaborators wired into an agent
pub struct AgentDeps {
    pub client: Arc<dyn ManagerClient>,
    pub source: Box<dyn EventSource>,
    pub engine_factory: EngineFactory,
    pub sink: Box<dyn EventSink>,
}

impl AgentDeps {
    /// Production wiring: HTTP manager when forwarding is enabled, rule
    /// engine, JSON lines telemetry and a manager or local alert sink
    pub fn from_config(config: &Config, input: SourceInput) -> Result<Self, AgentError> {
        let client: Arc<dyn ManagerClient> = if config.is_forwarding_enabled() {
            Arc::new(HttpManagerClient::new(&config.forwarder.manager))
        } else {
            Arc::new(LocalClient)
        };

        let logging = &config.forwarder.logging;
        let file_sink = FileSink::new(logging.dir.clone(), logging.rotation_size)
            .map_err(|e| AgentError::Io(format!("{}: {}", logging.dir.display(), e)))?;
        let sink: Box<dyn EventSink> = if client.is_local() {
            Box::new(file_sink)
        } else {
            Box::new(ManagerSink::new(client.clone(), file_sink))
        };

        Ok(Self {
            client,
            source: Box::new(JsonLinesSource::new(input)),
            engine_factory: crate::logic::engine::rule_engine_factory(),
            sink,
        })
    }
}

// ============================================================================
// AGENT
// ============================================================================

pub struct Agent {
    config: Config,
    channels: Vec<String>,
    client: Arc<dyn ManagerClient>,
    source: Box<dyn EventSource>,

    engine_factory: EngineFactory,
    engine: RwLock<Box<dyn DetectionEngine>>,
    /// Serializes fetch + rebuild so two refreshes never interleave
    update_lock: Mutex<()>,
    sync: RuleSync,

    pre_hooks: HookManager,
    post_hooks: HookManager,
    tracker: RwLock<ActivityTracker>,
    forwarder: Forwarder,
    compressor: Option<Arc<Compressor>>,
    hook_semaphore: Arc<Semaphore>,

    guid: RwLock<String>,
    pid: u32,
    proc_term_seen: AtomicBool,
    dry_run: AtomicBool,
    print_all: AtomicBool,

    events_scanned: AtomicU64,
    alerts_reported: AtomicU64,
    started: Instant,

    stop: StopSignal,
    ingestion: WaitGroup,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Initialize the agent and load the detection engine
    pub fn new(config: Config, deps: AgentDeps) -> Result<Arc<Self>, AgentError> {
        config.prepare()?;
        config.verify()?;

        // Output must exist before anything can produce alerts
        let forwarder = Forwarder::start(deps.sink);

        if config.is_dump_enabled() {
            let removed = remove_empty_dirs(&config.dump.dir);
            if removed > 0 {
                log::info!("Removed {} empty dump directories", removed);
            }
        }

        let channels = config::expand_channels(&config.channels);

        let mut pre_hooks = HookManager::new();
        builtin::register_pre_hooks(&mut pre_hooks);
        let mut post_hooks = HookManager::new();
        if config.enable_hooks {
            builtin::register_post_hooks(&mut post_hooks, &config);
        }

        config.canaries.configure();
        config.audit.configure();

        // Only compressed dumps are uploaded, forwarding forces compression
        let compress = config.dump.compression || config.is_forwarding_enabled();
        let compressor = (config.is_dump_enabled() && compress).then(|| Arc::new(Compressor::start()));

        let sync = RuleSync::new(
            deps.client.clone(),
            config.rules.rules_db.clone(),
            config.rules.containers_db.clone(),
        );

        let agent = Arc::new(Self {
            engine: RwLock::new((deps.engine_factory)()),
            engine_factory: deps.engine_factory,
            update_lock: Mutex::new(()),
            sync,
            channels,
            client: deps.client,
            source: deps.source,
            pre_hooks,
            post_hooks,
            tracker: RwLock::new(ActivityTracker::new()),
            forwarder,
            compressor,
            hook_semaphore: Arc::new(Semaphore::new(HOOK_SEMAPHORE_SIZE)),
            guid: RwLock::new(String::new()),
            pid: std::process::id(),
            proc_term_seen: AtomicBool::new(false),
            dry_run: AtomicBool::new(false),
            print_all: AtomicBool::new(false),
            events_scanned: AtomicU64::new(0),
            alerts_reported: AtomicU64::new(0),
            started: Instant::now(),
            stop: StopSignal::new(),
            ingestion: WaitGroup::new(),
            workers: Mutex::new(Vec::new()),
            config,
        });

        log::info!(
            "Agent initialized (pid {}, {} channels, pre-hooks [{}], post-hooks [{}])",
            agent.pid,
            agent.channels.len(),
            agent.pre_hooks.names().join(", "),
            agent.post_hooks.names().join(", ")
        );

        agent.update_engine(true)?;
        Ok(agent)
    }

    // ------------------------------------------------------------------------
    // Engine
    // ------------------------------------------------------------------------

    /// Sync rules and containers with the manager and rebuild the engine
    /// when anything changed or `force` is set. On a rule load failure the
    /// previous engine stays active.
    pub fn update_engine(&self, force: bool) -> Result<(), AgentError> {
        let _update = self.update_lock.lock();

        let mut reload_rules = self.sync.needs_rules_update();
        let mut reload_containers = self.sync.needs_containers_update();

        if reload_rules {
            log::info!("Updating rules from manager");
            if let Err(e) = self.sync.fetch_rules() {
                log::error!("Failed to fetch rules from manager: {}", e);
                reload_rules = false;
            }
        }

        if reload_containers {
            log::info!("Updating containers from manager");
            if let Err(e) = self.sync.fetch_containers() {
                log::error!("Failed to fetch containers from manager: {}", e);
                reload_containers = false;
            }
        }

        if !(reload_rules || reload_containers || force) {
            return Ok(());
        }

        let mut active = self.engine.write();

        let mut engine = (self.engine_factory)();
        engine.set_show_actions(true);

        // Rules reference containers, load them first
        let errors = self.sync.load_containers(engine.as_mut());
        let failures = errors.failures();
        if let Err(e) = errors.into_result() {
            log::error!("{} container(s) failed to load, last error: {}", failures, e);
        }

        if self.config.canaries.enable {
            for definition in [
                self.config.canaries.gen_rule_generic(),
                self.config.canaries.gen_rule_fs_audit(),
            ] {
                let added = definition
                    .compile()
                    .and_then(|rule| engine.add_rule(rule));
                if let Err(e) = added {
                    log::error!("Failed to add canary rule {}: {}", definition.name, e);
                }
            }
        }

        engine.load_directory(self.sync.rules_db())?;

        log::info!("Detection engine loaded ({} rules)", engine.count());
        *active = engine;
        Ok(())
    }

    pub fn engine_count(&self) -> usize {
        self.engine.read().count()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Subscribe to telemetry and start the ingestion and background threads
    pub fn run(self: &Arc<Self>, mode: SubscribeMode) {
        let events = self.source.fetch_events(&self.channels, mode);

        self.ingestion.add(1);
        let agent = self.clone();
        let ingestion = thread::spawn(move || {
            agent.ingest(events);
            agent.ingestion.done();
        });

        let mut workers = self.workers.lock();
        workers.push(ingestion);
        workers.extend(scheduler::start(self));
        drop(workers);

        self.spawn_marker_child();
    }

    /// Run a short-lived child of the agent. Its creation event reveals the
    /// agent GUID to the self-event filter and its exit shows whether
    /// process termination events are collected.
    fn spawn_marker_child(&self) {
        let Some(mut child) = marker_child_command() else {
            return;
        };
        thread::spawn(move || {
            if let Err(e) = child.run() {
                log::warn!("Marker child process failed: {}", e);
            }
        });
    }

    /// Stop in dependency order: output first, then input, then the loops
    pub fn stop(&self) {
        log::info!("Stopping agent");
        self.forwarder.close();
        self.source.stop();
        self.config.canaries.clean();
        self.config.audit.restore();
        self.stop.stop();
        if let Some(compressor) = &self.compressor {
            compressor.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Block until ingestion drained and every background thread exited
    pub fn wait(&self) {
        self.ingestion.wait();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                log::error!("Agent worker panicked");
            }
        }
    }

    /// Wait for ingestion at most `timeout`; returns true if it finished.
    /// The loop itself is not cancelled on timeout.
    pub fn wait_with_timeout(&self, timeout: Duration) -> bool {
        self.ingestion.wait_timeout(timeout)
    }

    pub(crate) fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    // ------------------------------------------------------------------------
    // Hook facing state
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn ManagerClient> {
        &self.client
    }

    pub fn tracker(&self) -> &RwLock<ActivityTracker> {
        &self.tracker
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Process GUID of the agent, empty until learned from telemetry
    pub fn guid(&self) -> String {
        self.guid.read().clone()
    }

    pub fn set_guid(&self, guid: &str) {
        *self.guid.write() = guid.to_string();
    }

    pub fn mark_proc_term_seen(&self) {
        self.proc_term_seen.store(true, Ordering::SeqCst);
    }

    pub fn hook_semaphore(&self) -> &Arc<Semaphore> {
        &self.hook_semaphore
    }

    pub fn compressor(&self) -> Option<&Arc<Compressor>> {
        self.compressor.as_ref()
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::SeqCst)
    }

    pub fn set_dry_run(&self, dry_run: bool) {
        self.dry_run.store(dry_run, Ordering::SeqCst);
    }

    pub fn is_print_all(&self) -> bool {
        self.print_all.load(Ordering::SeqCst)
    }

    pub fn set_print_all(&self, print_all: bool) {
        self.print_all.store(print_all, Ordering::SeqCst);
    }

    /// Telemetry produced by the agent or its direct children
    pub fn is_self_event(&self, event: &Event) -> bool {
        let guid = self.guid();
        if guid.is_empty() {
            return false;
        }
        if event.parent_process_guid().as_deref() == Some(guid.as_str()) {
            return true;
        }

        let tracker = self.tracker.read();
        let is_self = |actor: Option<String>| {
            actor.map_or(false, |actor| {
                actor == guid
                    || tracker
                        .get_by_guid(&actor)
                        .map_or(false, |track| track.parent_guid == guid)
            })
        };
        is_self(event.process_guid()) || is_self(event.source_process_guid())
    }

    // ------------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------------

    pub fn events_scanned(&self) -> u64 {
        self.events_scanned.load(Ordering::SeqCst)
    }

    pub fn alerts_reported(&self) -> u64 {
        self.alerts_reported.load(Ordering::SeqCst)
    }

    pub fn log_stats(&self) {
        let uptime = self.started.elapsed();
        let scanned = self.events_scanned();
        let eps = scanned as f64 / uptime.as_secs_f64().max(1.0);
        log::info!(
            "Stats: uptime={}s scanned={} eps={:.2} alerts={} rules={}",
            uptime.as_secs(),
            scanned,
            eps,
            self.alerts_reported(),
            self.engine_count()
        );
    }

    /// Forensic snapshot; `light` skips the configured commands
    pub fn report(&self, light: bool) -> Report {
        let snapshot = self.tracker.read().clone();
        Report::assemble(&snapshot, &self.config.report, light)
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Remove empty directories below the dump directory
    pub fn remove_empty_dump_dirs(&self) -> usize {
        remove_empty_dirs(&self.config.dump.dir)
    }
}

/// The agent binary asking for its own help text
fn marker_child_command() -> Option<Command> {
    match std::env::current_exe() {
        Ok(exe) => Some(Command::new(&exe.to_string_lossy(), &["--help"])),
        Err(e) => {
            log::warn!("Cannot locate agent executable: {}", e);
            None
        }
    }
}

/// Remove empty directories below `root`, deepest first; `root` is kept
pub fn remove_empty_dirs(root: &Path) -> usize {
    let mut removed = 0;
    let dirs = WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir());

    for dir in dirs {
        let is_empty = fs::read_dir(dir.path()).map_or(false, |mut d| d.next().is_none());
        if is_empty && fs::remove_dir(dir.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum AgentError {
    Config(ConfigError),
    Engine(EngineError),
    Io(String),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Config(e) => write!(f, "Configuration error: {}", e),
            AgentError::Engine(e) => write!(f, "Failed to load detection engine: {}", e),
            AgentError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<ConfigError> for AgentError {
    fn from(e: ConfigError) -> Self {
        AgentError::Config(e)
    }
}

impl From<EngineError> for AgentError {
    fn from(e: EngineError) -> Self {
        AgentError::Engine(e)
    }
}
