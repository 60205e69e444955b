//! Circuit breaker for failure detection and recovery.
//!
//! One breaker per command type. Consecutive handler failures open the
//! circuit; while open, commands of that type are rejected without invoking
//! the handler. After a cooldown the breaker admits a limited budget of
//! concurrent trial commands; any trial success closes the circuit, any
//! trial failure reopens it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::services::observability::{BusObservation, ObservabilityHub};

/// Tuning knobs for all breakers managed by one service.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Duration to keep the circuit open before trying half-open.
    pub cooldown: Duration,
    /// Concurrent trial commands admitted while half-open. Any one trial
    /// success closes the circuit.
    pub trial_budget: u32,
    /// Whether breakers are enforced at all.
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            trial_budget: 2,
            enabled: true,
        }
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are blocked.
    Open,
    /// Trial requests are probing for recovery.
    HalfOpen,
}

impl CircuitState {
    /// Stable string form for logs and snapshots.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Decision returned by [`CircuitBreakerService::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Circuit closed, proceed normally.
    Allowed,
    /// Circuit half-open, proceed as a trial. The caller must report the
    /// outcome or call `abandon` if the handler never ran.
    Trial,
    /// Circuit open, do not invoke the handler.
    Blocked {
        /// Time until the breaker transitions to half-open.
        retry_after: Duration,
    },
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
}

impl Breaker {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trials_in_flight: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trials_in_flight = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trials_in_flight = 0;
    }
}

/// Manages one breaker per command type, keyed by short type name.
pub struct CircuitBreakerService {
    breakers: RwLock<HashMap<String, Breaker>>,
    config: CircuitBreakerConfig,
    hub: Option<Arc<ObservabilityHub>>,
}

impl CircuitBreakerService {
    /// Create a service with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { breakers: RwLock::new(HashMap::new()), config, hub: None }
    }

    /// Report state transitions through an observability hub.
    #[must_use]
    pub fn with_hub(mut self, hub: Arc<ObservabilityHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    fn emit_state(&self, command_type: &str, state: CircuitState) {
        if let Some(hub) = &self.hub {
            let command_type = command_type.to_string();
            hub.emit(|| BusObservation::CircuitStateChanged {
                command_type,
                state: state.as_str(),
            });
        }
    }

    /// Ask whether a command of this type may proceed. An open breaker
    /// whose cooldown has elapsed transitions to half-open here.
    pub async fn begin(&self, command_type: &str) -> CircuitDecision {
        if !self.config.enabled {
            return CircuitDecision::Allowed;
        }
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(command_type.to_string()).or_insert_with(Breaker::new);
        match breaker.state {
            CircuitState::Closed => CircuitDecision::Allowed,
            CircuitState::Open => {
                let elapsed = breaker.opened_at.map_or(self.config.cooldown, |t| t.elapsed());
                if elapsed >= self.config.cooldown {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.trials_in_flight = 1;
                    info!(command_type, "circuit half-open, admitting trial");
                    self.emit_state(command_type, CircuitState::HalfOpen);
                    CircuitDecision::Trial
                } else {
                    CircuitDecision::Blocked { retry_after: self.config.cooldown - elapsed }
                }
            }
            CircuitState::HalfOpen => {
                if breaker.trials_in_flight < self.config.trial_budget {
                    breaker.trials_in_flight += 1;
                    CircuitDecision::Trial
                } else {
                    CircuitDecision::Blocked { retry_after: Duration::ZERO }
                }
            }
        }
    }

    /// Report a successful handler invocation.
    pub async fn record_success(&self, command_type: &str) {
        if !self.config.enabled {
            return;
        }
        let mut breakers = self.breakers.write().await;
        let Some(breaker) = breakers.get_mut(command_type) else {
            return;
        };
        match breaker.state {
            CircuitState::Closed => breaker.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                info!(command_type, "circuit closed after successful trial");
                breaker.close();
                self.emit_state(command_type, CircuitState::Closed);
            }
            CircuitState::Open => {}
        }
    }

    /// Report a failed handler invocation.
    pub async fn record_failure(&self, command_type: &str) {
        if !self.config.enabled {
            return;
        }
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(command_type.to_string()).or_insert_with(Breaker::new);
        match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        command_type,
                        failures = breaker.consecutive_failures,
                        "circuit opened"
                    );
                    breaker.open();
                    self.emit_state(command_type, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(command_type, "trial failed, circuit reopened");
                breaker.consecutive_failures += 1;
                breaker.open();
                self.emit_state(command_type, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Release a trial slot when the handler was never invoked, keeping the
    /// half-open budget accurate.
    pub async fn abandon(&self, command_type: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(command_type) {
            if breaker.state == CircuitState::HalfOpen {
                breaker.trials_in_flight = breaker.trials_in_flight.saturating_sub(1);
            }
        }
    }

    /// Current state of one breaker, if it has ever been touched.
    pub async fn state(&self, command_type: &str) -> Option<CircuitState> {
        self.breakers.read().await.get(command_type).map(|b| b.state)
    }

    /// Snapshot of every breaker's state, keyed by command type name.
    pub async fn states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .read()
            .await
            .iter()
            .map(|(k, b)| (k.clone(), b.state))
            .collect()
    }

    /// Force a breaker closed, clearing its failure history.
    pub async fn reset(&self, command_type: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(command_type) {
            debug!(command_type, "circuit reset");
            breaker.close();
            self.emit_state(command_type, CircuitState::Closed);
        }
    }
}
