//! Tunnel orchestration.
//!
//! The orchestrator owns the mapping from tunnel name to adapter and status.
//! All state sits behind one lock that is only held for short, non-async
//! critical sections; adapter dials run on spawned workers and their results
//! are applied only if the attempt is still current.

use chrono::Utc;
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, TunnelConfig};
use crate::probe::LatencyProbe;
use crate::tunnel::adapter::{AdapterRegistry, ProtocolAdapter};
use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::policy::{lowest_latency, SelectionMethod};
use crate::tunnel::types::{TunnelEvent, TunnelState, TunnelStatus};

/// Pause between stopping and restarting so local listeners release their ports.
pub const DEFAULT_RESTART_PAUSE: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 64;

/// Orchestrator behaviour taken from configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub auto_select: bool,
    pub selection_method: SelectionMethod,
    pub restart_pause: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings {
            auto_select: false,
            selection_method: SelectionMethod::Latency,
            restart_pause: DEFAULT_RESTART_PAUSE,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        OrchestratorSettings {
            auto_select: config.auto_select,
            selection_method: SelectionMethod::from_name(&config.selection_method),
            restart_pause: DEFAULT_RESTART_PAUSE,
        }
    }
}

struct TunnelEntry {
    adapter: Arc<dyn ProtocolAdapter>,
    status: TunnelStatus,
    /// Bumped on every start and stop; stale worker results are dropped.
    attempt: u64,
    session: Option<CancellationToken>,
}

#[derive(Default)]
struct OrchestratorState {
    /// Configuration order is the selection tie-break order.
    configs: Vec<TunnelConfig>,
    entries: HashMap<String, TunnelEntry>,
}

impl OrchestratorState {
    fn config(&self, name: &str) -> Option<&TunnelConfig> {
        self.configs.iter().find(|c| c.name == name)
    }
}

struct Inner {
    settings: OrchestratorSettings,
    registry: AdapterRegistry,
    state: RwLock<OrchestratorState>,
    scope: CancellationToken,
    events: broadcast::Sender<TunnelEvent>,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, OrchestratorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, OrchestratorState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, name: &str, state: TunnelState, error: Option<String>) {
        // No receivers is fine.
        let _ = self.events.send(TunnelEvent {
            name: name.to_string(),
            state,
            at: Utc::now(),
            error,
        });
    }

    /// Instantiates adapters for enabled configs that do not have one yet.
    fn register_adapters(&self) {
        let mut guard = self.write();
        let state = &mut *guard;
        for config in state.configs.iter().filter(|c| c.enabled) {
            if state.entries.contains_key(&config.name) {
                continue;
            }
            match self.registry.create(config) {
                Ok(adapter) => {
                    debug!(
                        tunnel = %config.name,
                        transport = %config.transport,
                        "Registered adapter"
                    );
                    state.entries.insert(
                        config.name.clone(),
                        TunnelEntry {
                            adapter,
                            status: TunnelStatus::new(config),
                            attempt: 0,
                            session: None,
                        },
                    );
                }
                Err(e) => {
                    warn!(
                        tunnel = %config.name,
                        error = %e,
                        "Excluding tunnel from the active set"
                    );
                }
            }
        }
    }

    /// Applies the outcome of a start worker if it is still current.
    fn finish_attempt(
        &self,
        name: &str,
        attempt: u64,
        adapter: Arc<dyn ProtocolAdapter>,
        outcome: TunnelResult<()>,
    ) {
        let current = !self.scope.is_cancelled() && {
            let mut state = self.write();
            match state.entries.get_mut(name) {
                Some(entry)
                    if entry.attempt == attempt && entry.status.state == TunnelState::Connecting =>
                {
                    match &outcome {
                        Ok(()) => {
                            entry.status.state = TunnelState::Connected;
                            info!(tunnel = %name, "Tunnel connected");
                            self.emit(name, TunnelState::Connected, None);
                        }
                        Err(e) => {
                            let message = e.to_string();
                            entry.status.state = TunnelState::Error;
                            entry.status.last_error = Some(message.clone());
                            warn!(tunnel = %name, error = %message, "Tunnel failed to connect");
                            self.emit(name, TunnelState::Error, Some(message));
                        }
                    }
                    true
                }
                _ => false,
            }
        };

        if !current {
            debug!(tunnel = %name, attempt, "Discarding stale start result");
            if outcome.is_ok() {
                tokio::spawn(async move {
                    if let Err(e) = adapter.stop().await {
                        debug!(error = %e, "Cleanup of stale session failed");
                    }
                });
            }
        }
    }
}

/// Owns configured tunnels, their adapters and their observed status.
#[derive(Clone)]
pub struct TunnelOrchestrator {
    inner: Arc<Inner>,
}

impl TunnelOrchestrator {
    pub fn new(
        configs: Vec<TunnelConfig>,
        settings: OrchestratorSettings,
        registry: AdapterRegistry,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        TunnelOrchestrator {
            inner: Arc::new(Inner {
                settings,
                registry,
                state: RwLock::new(OrchestratorState {
                    configs,
                    entries: HashMap::new(),
                }),
                scope: CancellationToken::new(),
                events,
            }),
        }
    }

    /// Orchestrator over `config.servers` with the default adapters.
    pub fn from_config(config: &AppConfig) -> Self {
        let probe = LatencyProbe::new(config.latency_timeout());
        Self::new(
            config.servers.clone(),
            OrchestratorSettings::from_config(config),
            AdapterRegistry::with_defaults(probe),
        )
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Scope cancelled by [`TunnelOrchestrator::shutdown`].
    pub fn scope(&self) -> CancellationToken {
        self.inner.scope.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    fn ensure_running(&self) -> TunnelResult<()> {
        if self.inner.scope.is_cancelled() {
            return Err(TunnelError::ShutDown);
        }
        Ok(())
    }

    /// Registers adapters for every enabled tunnel and, with auto-select,
    /// starts the one chosen by the selection policy. Returns its name.
    pub async fn start(&self) -> TunnelResult<Option<String>> {
        self.ensure_running()?;
        self.inner.register_adapters();

        if !self.inner.settings.auto_select {
            return Ok(None);
        }

        let active = {
            let state = self.inner.read();
            state
                .configs
                .iter()
                .find(|c| {
                    state
                        .entries
                        .get(&c.name)
                        .is_some_and(|e| e.status.state.is_active())
                })
                .map(|c| c.name.clone())
        };
        if let Some(name) = active {
            debug!(tunnel = %name, "Tunnel already active, skipping selection");
            return Ok(Some(name));
        }

        let chosen = self.select().await?;
        info!(
            tunnel = %chosen,
            method = %self.inner.settings.selection_method,
            "Auto-selected tunnel"
        );
        self.start_tunnel(&chosen)?;
        Ok(Some(chosen))
    }

    /// Moves the tunnel to `connecting` and dials on a spawned worker.
    ///
    /// Returns immediately; the outcome shows up in [`TunnelOrchestrator::status`]
    /// and on the event channel. Starting an active tunnel is a no-op.
    pub fn start_tunnel(&self, name: &str) -> TunnelResult<()> {
        self.ensure_running()?;

        let (adapter, attempt, session) = {
            let mut guard = self.inner.write();
            let state = &mut *guard;
            let config = state
                .configs
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| TunnelError::NotFound(name.to_string()))?;
            if !config.enabled {
                return Err(TunnelError::Disabled(name.to_string()));
            }
            let entry = state.entries.get_mut(name).ok_or_else(|| {
                TunnelError::TransportUnsupported {
                    name: name.to_string(),
                    kind: config.transport,
                }
            })?;

            if !entry.adapter.can_start() {
                return Err(TunnelError::TransportUnsupported {
                    name: name.to_string(),
                    kind: config.transport,
                });
            }
            if entry.status.state.is_active() {
                debug!(
                    tunnel = %name,
                    state = %entry.status.state,
                    "Start ignored, tunnel already active"
                );
                return Ok(());
            }

            entry.attempt += 1;
            let session = self.inner.scope.child_token();
            entry.session = Some(session.clone());
            entry.status.state = TunnelState::Connecting;
            entry.status.start_time = Some(Utc::now());
            entry.status.last_error = None;
            self.inner.emit(name, TunnelState::Connecting, None);

            (Arc::clone(&entry.adapter), entry.attempt, session)
        };

        info!(tunnel = %name, "Tunnel connecting");
        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        tokio::spawn(async move {
            let outcome = adapter.start(session).await;
            inner.finish_attempt(&name, attempt, adapter, outcome);
        });
        Ok(())
    }

    /// Stops one tunnel. The tunnel ends up `disconnected` even when the
    /// adapter reports an error, which is still returned.
    pub async fn stop_tunnel(&self, name: &str) -> TunnelResult<()> {
        let (adapter, session) = {
            let mut state = self.inner.write();
            if state.config(name).is_none() {
                return Err(TunnelError::NotFound(name.to_string()));
            }
            let Some(entry) = state.entries.get_mut(name) else {
                return Ok(());
            };
            entry.attempt += 1;
            if entry.status.state != TunnelState::Disconnected {
                entry.status.state = TunnelState::Disconnected;
                self.inner.emit(name, TunnelState::Disconnected, None);
            }
            (Arc::clone(&entry.adapter), entry.session.take())
        };

        if let Some(session) = session {
            session.cancel();
        }
        let result = adapter.stop().await;

        match &result {
            Ok(()) => info!(tunnel = %name, "Tunnel stopped"),
            Err(e) => warn!(tunnel = %name, error = %e, "Adapter reported an error while stopping"),
        }
        result
    }

    /// Stops every registered tunnel, reporting all adapter errors together.
    pub async fn stop_all(&self) -> TunnelResult<()> {
        let names: Vec<String> = {
            let state = self.inner.read();
            state
                .configs
                .iter()
                .filter(|c| state.entries.contains_key(&c.name))
                .map(|c| c.name.clone())
                .collect()
        };

        let results = join_all(names.iter().map(|name| self.stop_tunnel(name))).await;
        let errors: Vec<String> = names
            .iter()
            .zip(results)
            .filter_map(|(name, result)| result.err().map(|e| format!("{name}: {e}")))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TunnelError::StopFailed(errors))
        }
    }

    /// Stop everything, pause, then run [`TunnelOrchestrator::start`] again.
    pub async fn restart_all(&self) -> TunnelResult<Option<String>> {
        info!("Restarting all tunnels");
        if let Err(e) = self.stop_all().await {
            warn!(error = %e, "Continuing restart after stop errors");
        }
        tokio::time::sleep(self.inner.settings.restart_pause).await;
        self.start().await
    }

    /// Probes the tunnel's endpoint without touching its lifecycle state.
    pub async fn test(&self, name: &str) -> TunnelResult<Duration> {
        let adapter = {
            let state = self.inner.read();
            let config = state
                .config(name)
                .ok_or_else(|| TunnelError::NotFound(name.to_string()))?;
            state
                .entries
                .get(name)
                .map(|e| Arc::clone(&e.adapter))
                .ok_or_else(|| TunnelError::TransportUnsupported {
                    name: name.to_string(),
                    kind: config.transport,
                })?
        };

        let latency = adapter.probe().await?;
        if let Some(entry) = self.inner.write().entries.get_mut(name) {
            entry.status.latency = Some(latency);
        }
        debug!(tunnel = %name, latency_ms = latency.as_millis() as u64, "Probe finished");
        Ok(latency)
    }

    /// Copies of every registered tunnel's status.
    pub fn status(&self) -> BTreeMap<String, TunnelStatus> {
        let state = self.inner.read();
        state
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), snapshot(entry)))
            .collect()
    }

    pub fn tunnel_status(&self, name: &str) -> Option<TunnelStatus> {
        self.inner.read().entries.get(name).map(snapshot)
    }

    /// Configured tunnels in configuration order.
    pub fn tunnels(&self) -> Vec<TunnelConfig> {
        self.inner.read().configs.clone()
    }

    pub fn tunnel(&self, name: &str) -> Option<TunnelConfig> {
        self.inner.read().config(name).cloned()
    }

    /// Adds a tunnel record and registers its adapter when enabled. Returns
    /// the record as stored, defaults applied.
    pub fn add_tunnel(&self, mut config: TunnelConfig) -> TunnelResult<TunnelConfig> {
        self.ensure_running()?;
        {
            let mut state = self.inner.write();
            config.apply_defaults(state.configs.len());
            config.validate()?;
            if state.config(&config.name).is_some() {
                return Err(TunnelError::AlreadyExists(config.name));
            }
            if let Some(clash) = state
                .configs
                .iter()
                .find(|c| c.enabled && config.enabled && c.local_port == config.local_port)
            {
                return Err(TunnelError::Config(crate::config::ConfigError::InvalidValue {
                    key: format!("servers.{}.local_port", config.name),
                    message: format!("local port {} is used by {}", config.local_port, clash.name),
                }));
            }
            info!(tunnel = %config.name, host = %config.host, "Added tunnel");
            state.configs.push(config.clone());
        }
        self.inner.register_adapters();
        Ok(config)
    }

    /// Replaces a tunnel's record. An active tunnel is stopped first and must
    /// be started again by the caller.
    pub async fn update_tunnel(&self, name: &str, mut config: TunnelConfig) -> TunnelResult<()> {
        self.ensure_running()?;
        if self.tunnel(name).is_none() {
            return Err(TunnelError::NotFound(name.to_string()));
        }
        config.name = name.to_string();
        config.validate()?;

        if let Err(e) = self.stop_tunnel(name).await {
            warn!(tunnel = %name, error = %e, "Stop before update reported an error");
        }

        {
            let mut state = self.inner.write();
            let index = state
                .configs
                .iter()
                .position(|c| c.name == name)
                .ok_or_else(|| TunnelError::NotFound(name.to_string()))?;
            config.apply_defaults(index);
            state.configs[index] = config;
            state.entries.remove(name);
        }
        self.inner.register_adapters();
        info!(tunnel = %name, "Updated tunnel");
        Ok(())
    }

    /// Stops and forgets a tunnel.
    pub async fn remove_tunnel(&self, name: &str) -> TunnelResult<()> {
        if let Err(e) = self.stop_tunnel(name).await {
            if matches!(e, TunnelError::NotFound(_)) {
                return Err(e);
            }
            warn!(tunnel = %name, error = %e, "Stop before removal reported an error");
        }

        let mut state = self.inner.write();
        state.configs.retain(|c| c.name != name);
        state.entries.remove(name);
        info!(tunnel = %name, "Removed tunnel");
        Ok(())
    }

    /// Cancels the orchestrator scope and stops every tunnel. Results of
    /// in-flight dials are discarded from here on.
    pub async fn shutdown(&self) -> TunnelResult<()> {
        self.inner.scope.cancel();
        self.stop_all().await
    }

    async fn select(&self) -> TunnelResult<String> {
        let mut candidates: Vec<(i32, String, Arc<dyn ProtocolAdapter>)> = {
            let state = self.inner.read();
            state
                .configs
                .iter()
                .filter(|c| c.enabled)
                .filter_map(|c| {
                    let entry = state.entries.get(&c.name)?;
                    entry
                        .adapter
                        .can_start()
                        .then(|| (c.priority, c.name.clone(), Arc::clone(&entry.adapter)))
                })
                .collect()
        };
        if candidates.is_empty() {
            return Err(TunnelError::NoEligibleTunnel);
        }
        // Stable: equal priorities keep configuration order.
        candidates.sort_by_key(|(priority, _, _)| *priority);

        match self.inner.settings.selection_method {
            SelectionMethod::Random => candidates
                .choose(&mut rand::thread_rng())
                .map(|(_, name, _)| name.clone())
                .ok_or(TunnelError::NoEligibleTunnel),
            SelectionMethod::LeastLoad => {
                debug!("No load signal for tunnels, selecting by latency");
                self.select_by_latency(candidates).await
            }
            SelectionMethod::Latency => self.select_by_latency(candidates).await,
        }
    }

    async fn select_by_latency(
        &self,
        candidates: Vec<(i32, String, Arc<dyn ProtocolAdapter>)>,
    ) -> TunnelResult<String> {
        let probes = join_all(candidates.iter().map(|(_, name, adapter)| async move {
            let result = adapter.probe().await;
            if let Err(e) = &result {
                debug!(tunnel = %name, error = %e, "Excluding tunnel, probe failed");
            }
            (name.clone(), result.ok())
        }))
        .await;

        {
            let mut state = self.inner.write();
            for (name, latency) in &probes {
                if let (Some(entry), Some(latency)) = (state.entries.get_mut(name), latency) {
                    entry.status.latency = Some(*latency);
                }
            }
        }

        lowest_latency(&probes)
            .map(str::to_string)
            .ok_or(TunnelError::NoEligibleTunnel)
    }
}

fn snapshot(entry: &TunnelEntry) -> TunnelStatus {
    let mut status = entry.status.clone();
    let stats = entry.adapter.status();
    status.bytes_sent = stats.bytes_sent;
    status.bytes_received = stats.bytes_received;
    status
}
