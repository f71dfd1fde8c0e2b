pub mod callback;
pub mod circuit_breaker;
pub mod config;
pub mod decision;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod executor;
pub mod model;
pub mod notify;
pub mod planner;
pub mod rest;
pub mod retry;
pub mod store;
pub mod tick;

use std::sync::Arc;

use crate::circuit_breaker::CircuitBreakers;
use crate::config::StewardConfig;
use crate::decision::DecisionEngine;
use crate::dispatcher::Dispatcher;
use crate::events::EventLog;
use crate::executor::AgentExecutor;
use crate::notify::{Notifier, NullNotifier, WebhookNotifier};
use crate::planner::{NoopPlanner, Planner};
use crate::retry::RetryAnalyzer;
use crate::store::{MemoryTaskStore, TaskStore};
use crate::tick::TickController;

/// Everything the daemon and the REST surface share, wired once at startup.
pub struct OrchestratorState {
    pub config: StewardConfig,
    pub store: Arc<dyn TaskStore>,
    pub events: Arc<EventLog>,
    pub notifier: Arc<dyn Notifier>,
    pub breakers: Arc<CircuitBreakers>,
    pub executor: Arc<AgentExecutor>,
    pub dispatcher: Arc<Dispatcher>,
    pub retry: Arc<RetryAnalyzer>,
    pub decisions: Arc<DecisionEngine>,
    pub tick: Arc<TickController>,
}

pub type SharedState = Arc<OrchestratorState>;

impl OrchestratorState {
    /// Wire the full component graph on top of the given store and planner.
    pub fn new(
        config: StewardConfig,
        store: Arc<dyn TaskStore>,
        planner: Arc<dyn Planner>,
    ) -> SharedState {
        let events = EventLog::new();
        let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(NullNotifier),
        };
        let breakers = CircuitBreakers::new(
            config.breaker.clone(),
            events.clone(),
            notifier.clone(),
        );
        let executor = AgentExecutor::new(config.agent.clone(), store.clone(), events.clone());
        let dispatcher = Dispatcher::new(
            store.clone(),
            events.clone(),
            breakers.clone(),
            executor.clone(),
            config.dispatch.clone(),
        );
        let retry = RetryAnalyzer::new(store.clone(), events.clone(), config.retry.max_retries);
        let decisions = DecisionEngine::new(
            store.clone(),
            events.clone(),
            config.tick.stale_threshold_hours,
            config.tick.auto_execute_confidence,
        );
        let tick = TickController::new(
            store.clone(),
            events.clone(),
            decisions.clone(),
            dispatcher.clone(),
            retry.clone(),
            planner,
            notifier.clone(),
            config.tick.clone(),
        );

        Arc::new(Self {
            config,
            store,
            events,
            notifier,
            breakers,
            executor,
            dispatcher,
            retry,
            decisions,
            tick,
        })
    }

    /// In-memory wiring with no planner attached. Used by the default daemon
    /// startup and by tests.
    pub fn in_memory(config: StewardConfig) -> SharedState {
        Self::new(config, MemoryTaskStore::new(), Arc::new(NoopPlanner))
    }
}
