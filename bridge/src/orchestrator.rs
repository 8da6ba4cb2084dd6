//! The orchestration engine.
//!
//! A single [`Orchestrator`] owns the registry and selector state and runs
//! three periodic cycles as background tasks: the Manager poll (definitions
//! and Instance list), the Instance status poll (primary flags), and the
//! transport heartbeat. Supervisors report back over one event channel; the
//! orchestrator is the only writer of registry and selector state, and hosts
//! observe it through stable snapshots.

use std::{future::Future, sync::Arc, time::Duration};

use adit_types::{
    fingerprint, BridgeStatus, DefinitionSet, InstanceRecord, Issue, Options,
};
use chrono::Utc;
use futures::future;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tokio_util::task::AbortOnDropHandle;
use uuid::Uuid;

use crate::{
    api::{self, ApiError, ManagerClient},
    cache::DefinitionCache,
    frames,
    host::{config_keys, Host},
    registry::{Registry, SupervisorSpawner},
    selector::PrimarySelector,
    supervisor::{EngineEvent, SupervisorTiming},
};

/// Stable copy of the engine's externally visible state.
#[derive(Clone, Debug)]
pub struct EngineSnapshot {
    pub status: BridgeStatus,
    pub effective_primary: Option<String>,
    /// Instance records in Manager order.
    pub instances: Vec<InstanceRecord>,
    pub definitions: DefinitionSet,
    /// Channel name remembered from the cache or the last fetch, for the
    /// host's channel dropdown while the Manager is down.
    pub cached_channel_name: Option<String>,
}

pub struct Orchestrator {
    opt: Arc<Mutex<Options>>,
    host: Arc<dyn Host>,
    session: Mutex<Option<Arc<Session>>>,
}

impl Orchestrator {
    pub fn new(opt: Options, host: Arc<dyn Host>) -> Self {
        Self {
            opt: Arc::new(Mutex::new(opt)),
            host,
            session: Mutex::new(None),
        }
    }

    /// Start the engine. Without a configured Manager endpoint the engine
    /// stays stopped and the host sees `badConfig`; this is a status, not an
    /// error. Starting a running engine is a no-op.
    pub fn start(&self) {
        let mut session_slot = self.session.lock();
        if session_slot.is_some() {
            tracing::debug!("engine already running");
            return;
        }
        let opt = self.opt.lock().clone();
        let Some(endpoint) = opt.manager_endpoint() else {
            let status = BridgeStatus::bad_config("Manager host and port are required");
            tracing::warn!(message = %status.message, "not starting");
            self.host.set_status(&status);
            return;
        };
        let control_interface_id = match opt.control_interface_id {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                tracing::info!(%id, "generated control interface id");
                self.host
                    .save_config(config_keys::CONTROL_INTERFACE_ID, &id.to_string());
                self.opt.lock().control_interface_id = Some(id);
                id
            }
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let timing = SupervisorTiming {
            connect_timeout: opt.connect_timeout,
            reconnect_delay: opt.reconnect_delay,
            pong_timeout: opt.pong_timeout,
        };
        let session = Arc::new(Session {
            opt: self.opt.clone(),
            endpoint: endpoint.clone(),
            host: self.host.clone(),
            api: ManagerClient::new(&endpoint, opt.manager_http_timeout),
            http: reqwest::Client::new(),
            state: Mutex::new(SessionState {
                registry: Registry::new(),
                selector: PrimarySelector::new(),
                definitions: DefinitionSet::default(),
                rules_fingerprint: None,
                variables_fingerprint: None,
                applied_channel: None,
                manager_reachable: None,
                ever_fetched: false,
                cache: DefinitionCache::new(&opt.definition_cache, &endpoint),
                cache_loaded: false,
                cached_channel_name: None,
                last_status: None,
                spawner: SupervisorSpawner {
                    control_interface_id,
                    timing,
                    events: events_tx,
                },
            }),
            tasks: Mutex::new(None),
        });

        let tasks = Tasks {
            _manager_poll: spawn_interval(session.clone(), opt.manager_poll_interval, |s| async move {
                s.manager_poll_cycle().await;
            }),
            _status_poll: spawn_interval(session.clone(), opt.status_poll_interval, |s| async move {
                s.status_poll_cycle().await;
            }),
            _heartbeat: spawn_interval(session.clone(), opt.heartbeat_interval, |s| async move {
                s.heartbeat_cycle();
            }),
            _events: AbortOnDropHandle::new(tokio::spawn({
                let session = session.clone();
                async move {
                    while let Some(event) = events_rx.recv().await {
                        session.on_engine_event(event);
                    }
                }
            })),
        };
        *session.tasks.lock() = Some(tasks);
        *session_slot = Some(session);
        tracing::info!(%endpoint, channel = ?opt.channel_id, "bridge engine started");
    }

    /// Stop the engine: cancel the cycles, close every transport without
    /// triggering reconnects, clear the registry, forget the election.
    /// Stopping a stopped engine is a no-op.
    pub fn stop(&self) {
        let Some(session) = self.session.lock().take() else {
            tracing::debug!("stop: engine not running");
            return;
        };
        session.tasks.lock().take();
        {
            let mut state = session.state.lock();
            state.registry.clear();
            state.selector.reset();
        }
        tracing::info!("bridge engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Adopt a fresh configuration. A changed Manager endpoint restarts the
    /// engine (a full reset of Instance state); everything else is picked up
    /// by the next cycles of the running session.
    pub fn update_options(&self, new: Options) {
        let restart = {
            let mut opt = self.opt.lock();
            let restart = opt.manager_endpoint() != new.manager_endpoint();
            *opt = new;
            restart
        };
        if restart && self.is_running() {
            tracing::info!("manager endpoint changed; restarting engine");
            self.stop();
            self.start();
        }
    }

    /// Stable copy of the current engine state; `None` while stopped.
    pub fn snapshot(&self) -> Option<EngineSnapshot> {
        let session = self.session.lock().as_ref().cloned()?;
        let channel_selected = self.opt.lock().channel_id.is_some();
        let state = session.state.lock();
        Some(EngineSnapshot {
            status: compute_status(&state, channel_selected),
            effective_primary: state.selector.effective().map(str::to_string),
            instances: state.registry.records().cloned().collect(),
            definitions: state.definitions.clone(),
            cached_channel_name: state.cached_channel_name.clone(),
        })
    }

    /// Broadcast a set-variable command to every connected Instance.
    /// Returns how many transports accepted the frame (possibly zero; the
    /// command is not queued for later).
    pub async fn set_variable(&self, variable_id: &str, value: &str) -> usize {
        self.broadcast(frames::set_variable_request(variable_id, value))
            .await
    }

    /// Broadcast an evaluate-rule command to every connected Instance.
    pub async fn evaluate_rule(&self, rule_id: &str) -> usize {
        self.broadcast(frames::evaluate_rule_request(rule_id)).await
    }

    async fn broadcast(&self, text: String) -> usize {
        let Some(session) = self.session.lock().as_ref().cloned() else {
            tracing::debug!("broadcast while engine stopped");
            return 0;
        };
        let receivers = session.state.lock().registry.send_to_connected(&text);
        let mut sent = 0;
        for rx in receivers {
            if rx.await.unwrap_or(false) {
                sent += 1;
            }
        }
        if sent == 0 {
            tracing::debug!("command reached no connected instances");
        }
        sent
    }
}

struct Session {
    opt: Arc<Mutex<Options>>,
    endpoint: String,
    host: Arc<dyn Host>,
    api: ManagerClient,
    http: reqwest::Client,
    state: Mutex<SessionState>,
    tasks: Mutex<Option<Tasks>>,
}

struct SessionState {
    registry: Registry,
    selector: PrimarySelector,
    definitions: DefinitionSet,
    rules_fingerprint: Option<String>,
    variables_fingerprint: Option<String>,
    applied_channel: Option<String>,
    /// `None` until the first Manager poll concludes either way.
    manager_reachable: Option<bool>,
    /// Whether channel data has ever been fetched successfully this session.
    ever_fetched: bool,
    cache: DefinitionCache,
    /// Latched after a cache-assisted cold start so the cache is loaded at
    /// most once per session.
    cache_loaded: bool,
    cached_channel_name: Option<String>,
    last_status: Option<BridgeStatus>,
    spawner: SupervisorSpawner,
}

struct Tasks {
    _manager_poll: AbortOnDropHandle<()>,
    _status_poll: AbortOnDropHandle<()>,
    _heartbeat: AbortOnDropHandle<()>,
    _events: AbortOnDropHandle<()>,
}

/// Host-visible side effects computed under the state lock and dispatched
/// after it is released.
#[derive(Default)]
struct Effects {
    rebind: Option<DefinitionSet>,
    save_cache: Option<String>,
    channel_name_hint: Option<String>,
}

fn spawn_interval<F, Fut>(session: Arc<Session>, period: Duration, f: F) -> AbortOnDropHandle<()>
where
    F: Fn(Arc<Session>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    AbortOnDropHandle::new(tokio::spawn(async move {
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            f(session.clone()).await;
        }
    }))
}

impl Session {
    async fn manager_poll_cycle(self: Arc<Self>) {
        let channel_id = self.opt.lock().channel_id.clone();

        let channels = match self.api.channels().await {
            Ok(channels) => channels,
            Err(err) => {
                self.on_manager_failure(&err, channel_id.as_deref());
                return;
            }
        };
        self.state.lock().definitions.channels = channels;

        let Some(channel_id) = channel_id else {
            self.note_manager_reachable();
            self.publish();
            return;
        };

        let (rules, variables, instances) = tokio::join!(
            self.api.rules(&channel_id),
            self.api.variables(&channel_id),
            self.api.instances(&channel_id),
        );
        let (rules, variables, instances) = match (rules, variables, instances) {
            (Ok(rules), Ok(variables), Ok(instances)) => (rules, variables, instances),
            (rules, variables, instances) => {
                let err = rules
                    .err()
                    .or(variables.err())
                    .or(instances.err())
                    .unwrap_or(ApiError::Unreachable("unknown".into()));
                self.on_manager_failure(&err, Some(&channel_id));
                return;
            }
        };
        self.note_manager_reachable();

        let mut effects = Effects::default();
        {
            let mut state = self.state.lock();
            state.ever_fetched = true;

            let rules_fp = fingerprint(&rules);
            let variables_fp = fingerprint(&variables);
            let changed = state.rules_fingerprint.as_deref() != Some(rules_fp.as_str())
                || state.variables_fingerprint.as_deref() != Some(variables_fp.as_str())
                || state.applied_channel.as_deref() != Some(channel_id.as_str());
            state.definitions.rules = rules;
            state.definitions.variables = variables;
            state.rules_fingerprint = Some(rules_fp);
            state.variables_fingerprint = Some(variables_fp);
            state.applied_channel = Some(channel_id.clone());
            if changed {
                effects.rebind = Some(state.definitions.clone());
            }

            let SessionState {
                registry,
                spawner,
                cache,
                definitions,
                cached_channel_name,
                ..
            } = &mut *state;
            registry.sync_against(&instances, spawner);

            let channel_name = definitions
                .channel_name(&channel_id)
                .unwrap_or(&channel_id)
                .to_string();
            cache.save(
                &channel_id,
                &channel_name,
                &instances,
                &definitions.variables,
                &definitions.rules,
            );
            effects.save_cache = cache.take_serialized();
            if cached_channel_name.as_deref() != Some(channel_name.as_str()) {
                *cached_channel_name = Some(channel_name.clone());
                effects.channel_name_hint = Some(channel_name);
            }
        }
        self.dispatch(effects);
        self.publish();
    }

    async fn status_poll_cycle(self: Arc<Self>) {
        let timeout = self.opt.lock().instance_http_timeout;
        let targets: Vec<(String, String, u16)> = self
            .state
            .lock()
            .registry
            .records()
            .map(|r| (r.id.clone(), r.ip_address.clone(), r.api_port))
            .collect();

        if !targets.is_empty() {
            let fetches = targets.into_iter().map(|(id, host, port)| {
                let client = self.http.clone();
                async move {
                    (
                        id,
                        api::fetch_instance_status(&client, &host, port, timeout).await,
                    )
                }
            });
            let results = future::join_all(fetches).await;

            let mut state = self.state.lock();
            for (id, result) in results {
                // The registry may have moved on while the fetch ran.
                let Some(entry) = state.registry.get_mut(&id) else {
                    continue;
                };
                match result {
                    Ok(status) => {
                        if entry.record.status_poll_failures > 0 {
                            tracing::info!(
                                instance = %entry.record.name,
                                failures = entry.record.status_poll_failures,
                                "status poll recovered",
                            );
                        }
                        entry.record.status_poll_failures = 0;
                        entry.record.reported_primary = Some(status.primary);
                        entry.record.last_status_code = Some(status.status_code);
                    }
                    Err(err) => {
                        entry.record.status_poll_failures += 1;
                        tracing::debug!(
                            instance = %entry.record.name,
                            %err,
                            failures = entry.record.status_poll_failures,
                            "status poll failed",
                        );
                    }
                }
            }
        }
        self.run_selector();
        self.publish();
    }

    fn heartbeat_cycle(self: Arc<Self>) {
        self.state.lock().registry.heartbeat_all();
    }

    fn on_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Conn { id, epoch, state: conn } => {
                {
                    let mut state = self.state.lock();
                    let Some(entry) = state.registry.get_mut(&id) else {
                        tracing::debug!(%id, "connection event for unregistered instance");
                        return;
                    };
                    if entry.epoch != epoch {
                        tracing::debug!(%id, "stale connection event");
                        return;
                    }
                    entry.record.conn_state = conn;

                    let SessionState {
                        registry, selector, ..
                    } = &mut *state;
                    let records: Vec<&InstanceRecord> = registry.records().collect();
                    selector.evaluate(&records);
                }
                self.publish();
            }
            EngineEvent::VariableUpdate {
                id,
                epoch,
                variable_id,
                value,
            } => {
                // The primary gate applies at the moment the update is
                // processed, so a just-elected primary contributes
                // immediately.
                let deliver = {
                    let state = self.state.lock();
                    state.registry.get(&id).is_some_and(|e| e.epoch == epoch)
                        && state.selector.effective() == Some(id.as_str())
                };
                if deliver {
                    self.host.set_variable_values(&[(variable_id, value)]);
                } else {
                    tracing::debug!(
                        instance = %id,
                        variable = %variable_id,
                        "dropping variable update from non-primary instance",
                    );
                }
            }
        }
    }

    fn on_manager_failure(&self, err: &ApiError, channel_id: Option<&str>) {
        {
            let mut state = self.state.lock();
            match state.manager_reachable {
                Some(false) => tracing::debug!(%err, "manager still unreachable"),
                _ => {
                    let connected = state.registry.connected_count();
                    if connected > 0 {
                        tracing::warn!(
                            %err,
                            "Manager unreachable, maintaining {connected} existing connections",
                        );
                    } else {
                        tracing::warn!(%err, "Manager unreachable");
                    }
                    state.manager_reachable = Some(false);
                }
            }
        }
        self.try_cache_cold_start(channel_id);
        self.publish();
    }

    fn note_manager_reachable(&self) {
        let mut state = self.state.lock();
        match state.manager_reachable {
            Some(true) => {}
            Some(false) => {
                tracing::info!("manager reachable again");
                state.manager_reachable = Some(true);
            }
            None => {
                tracing::info!(endpoint = %self.endpoint, "manager reachable");
                state.manager_reachable = Some(true);
            }
        }
    }

    /// Cache-assisted cold start: when the Manager has been unreachable
    /// since startup and nothing is registered yet, hydrate definitions and
    /// registry from the persisted cache. Runs at most once per session.
    fn try_cache_cold_start(&self, channel_id: Option<&str>) {
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock();
            if state.ever_fetched || state.cache_loaded || !state.registry.is_empty() {
                return;
            }
            let Some(channel_id) = channel_id else {
                return;
            };
            let record = state.cache.load(channel_id);
            effects.save_cache = state.cache.take_serialized();
            if let Some(record) = record {
                state.cache_loaded = true;
                tracing::info!(
                    "Using cached definitions for '{}' (cached {})",
                    record.channel_name,
                    record.age(Utc::now()),
                );
                state.definitions.variables = record.variables.clone();
                state.definitions.rules = record.rules.clone();
                state.rules_fingerprint = Some(fingerprint(&record.rules));
                state.variables_fingerprint = Some(fingerprint(&record.variables));
                state.applied_channel = Some(channel_id.to_string());
                state.cached_channel_name = Some(record.channel_name.clone());

                let SessionState {
                    registry, spawner, ..
                } = &mut *state;
                registry.sync_against(&record.instances, spawner);

                effects.rebind = Some(state.definitions.clone());
                effects.channel_name_hint = Some(record.channel_name);
            }
        }
        self.dispatch(effects);
    }

    fn run_selector(&self) {
        let mut state = self.state.lock();
        let SessionState {
            registry, selector, ..
        } = &mut *state;
        // Nothing registered and nothing elected: don't grind out a
        // no-candidates election every poll tick.
        if registry.is_empty() && selector.effective().is_none() {
            return;
        }
        let records: Vec<&InstanceRecord> = registry.records().collect();
        selector.evaluate(&records);
    }

    fn dispatch(&self, effects: Effects) {
        if let Some(definitions) = effects.rebind {
            self.host.rebind_definitions(&definitions);
        }
        if let Some(raw) = effects.save_cache {
            tracing::debug!(bytes = raw.len(), "persisting definition cache");
            self.host.save_config(config_keys::DEFINITION_CACHE, &raw);
        }
        if let Some(name) = effects.channel_name_hint {
            self.host.save_config(config_keys::CACHED_CHANNEL_NAME, &name);
        }
    }

    fn publish(&self) {
        let channel_selected = self.opt.lock().channel_id.is_some();
        let (status, variables) = {
            let mut state = self.state.lock();
            let status = compute_status(&state, channel_selected);
            let changed = state.last_status.as_ref() != Some(&status);
            if changed {
                state.last_status = Some(status.clone());
            }
            (changed.then_some(status), engine_variables(&state))
        };
        if let Some(status) = status {
            tracing::info!(level = %status.level, message = %status.message, "bridge status changed");
            self.host.set_status(&status);
        }
        self.host.set_variable_values(&variables);
    }
}

fn compute_status(state: &SessionState, channel_selected: bool) -> BridgeStatus {
    let mut issues = Vec::new();
    if state.manager_reachable == Some(false) {
        issues.push(Issue::ManagerUnreachable);
    }
    if !channel_selected {
        issues.push(Issue::NoChannelSelected);
    } else {
        if state.registry.is_empty() {
            issues.push(Issue::NoInstancesRegistered);
        }
        if state.registry.connected_count() == 0 {
            issues.push(Issue::NoInstancesConnected);
        }
        if state.selector.effective().is_none() {
            issues.push(Issue::NoPrimaryElected);
        }
    }
    let primary = state
        .selector
        .effective()
        .and_then(|id| state.registry.get(id))
        .map(|e| (e.record.name.clone(), e.record.id.clone()));
    BridgeStatus::from_issues(
        &issues,
        state.registry.len(),
        primary.as_ref().map(|(name, id)| (name.as_str(), id.as_str())),
    )
}

/// The diagnostic variables pushed to the host on every cycle: the election
/// result, connection counts, and per-Instance tuples in Manager order
/// indexed from 1.
fn engine_variables(state: &SessionState) -> Vec<(String, String)> {
    let primary = state
        .selector
        .effective()
        .and_then(|id| state.registry.get(id))
        .map(|e| &e.record);
    let mut values = vec![
        (
            "primary_instance_id".to_string(),
            primary.map(|r| r.id.clone()).unwrap_or_default(),
        ),
        (
            "primary_instance_name".to_string(),
            primary.map(|r| r.name.clone()).unwrap_or_default(),
        ),
        (
            "instances_connected".to_string(),
            state.registry.connected_count().to_string(),
        ),
        (
            "instances_registered".to_string(),
            state.registry.len().to_string(),
        ),
    ];
    for (index, record) in state.registry.records().enumerate() {
        let n = index + 1;
        values.push((format!("instance_{n}_id"), record.id.clone()));
        values.push((format!("instance_{n}_name"), record.name.clone()));
        values.push((format!("instance_{n}_description"), record.description.clone()));
        values.push((format!("instance_{n}_ip_address"), record.ip_address.clone()));
        values.push((format!("instance_{n}_port_number"), record.api_port.to_string()));
        values.push((format!("instance_{n}_connected"), record.healthy().to_string()));
        values.push((
            format!("instance_{n}_primary"),
            record
                .reported_primary
                .map(|p| p.to_string())
                .unwrap_or_default(),
        ));
    }
    values
}
