// Agent pool - bounded-concurrency lifecycle manager for LLM-backed agents

//! # Agent Pool
//!
//! Creates, invokes, and destroys agents bound to LLM clients:
//!
//! - **Admission**: at most `max_concurrent_agents` live at once (default 2).
//!   Callers past the cap suspend on a fair FIFO queue; dropping a waiting
//!   future releases its queue slot.
//! - **Personas**: loaded from `bmad/bmm/agents/<name>.md` under the
//!   configured root.
//! - **Serialisation**: one invocation at a time per agent; distinct agents
//!   invoke in parallel.
//! - **Cost accounting**: each invocation's estimated cost accumulates on
//!   the agent and in a pool-wide per-role metric map.
//! - **Events**: `agent.started` / `agent.invoked` / `agent.error` /
//!   `agent.completed` on the pool's [`EventBus`]; fire-and-forget.
//! - **Reaper**: optionally destroys agents that outlive
//!   `max_agent_execution_time`, checked every `health_check_interval`.

use crate::engine::events::EventBus;
use crate::llm::{CostTracker, LLMClient, LLMClientFactory};
use crate::models::{Agent, AgentContext, AgentEventType, AgentId};
use crate::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::{interval, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct AgentPoolConfig {
    /// Directory containing `<name>.md` persona files
    pub agents_dir: PathBuf,
    pub max_concurrent_agents: usize,
    /// Enables the hung-agent reaper together with
    /// `max_agent_execution_time`
    pub health_check_interval: Option<Duration>,
    pub max_agent_execution_time: Option<Duration>,
    /// Budget enforcement; spend is attributed to the agent role
    pub cost_tracker: Option<Arc<CostTracker>>,
}

impl AgentPoolConfig {
    /// Conventional layout under a project root.
    pub fn for_project(project_root: impl Into<PathBuf>) -> Self {
        Self {
            agents_dir: project_root.into().join("bmad").join("bmm").join("agents"),
            max_concurrent_agents: 2,
            health_check_interval: None,
            max_agent_execution_time: None,
            cost_tracker: None,
        }
    }
}

/// Optional filter for [`AgentPool::get_active_agents`].
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub name: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
}

struct ActiveAgent {
    snapshot: Agent,
    client: Arc<dyn LLMClient>,
    /// Serialises invocations on this agent
    invoke_lock: Arc<Mutex<()>>,
    /// Held for the agent's lifetime; dropping it pumps the admission queue
    _permit: OwnedSemaphorePermit,
}

/// Bounded-concurrency lifecycle manager.
pub struct AgentPool {
    config: AgentPoolConfig,
    factory: Arc<dyn LLMClientFactory>,
    events: Arc<EventBus>,
    admission: Arc<Semaphore>,
    active: RwLock<HashMap<AgentId, ActiveAgent>>,
    cost_metrics: RwLock<HashMap<String, f64>>,
    shutdown_token: CancellationToken,
}

impl AgentPool {
    /// Build the pool and start the hung-agent reaper when configured.
    pub fn new(config: AgentPoolConfig, factory: Arc<dyn LLMClientFactory>) -> Arc<Self> {
        let pool = Arc::new(Self {
            admission: Arc::new(Semaphore::new(config.max_concurrent_agents)),
            config,
            factory,
            events: Arc::new(EventBus::new()),
            active: RwLock::new(HashMap::new()),
            cost_metrics: RwLock::new(HashMap::new()),
            shutdown_token: CancellationToken::new(),
        });

        if let (Some(check), Some(max_age)) = (
            pool.config.health_check_interval,
            pool.config.max_agent_execution_time,
        ) {
            Self::spawn_reaper(Arc::downgrade(&pool), check, max_age);
        }

        pool
    }

    /// Lifecycle event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Create an agent for the named role, suspending while the pool is at
    /// capacity. The queue is strict FIFO; cancelling the call while queued
    /// releases the slot.
    pub async fn create_agent(&self, name: &str, context: AgentContext) -> Result<Agent> {
        let persona = self.load_persona(name).await?;

        let permit = self
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| {
                OrchestratorError::Cancelled(format!(
                    "agent pool shut down while '{name}' waited for admission"
                ))
            })?;

        // Client creation failures release the permit on drop
        let client = self.factory.create_client(name).await.map_err(|e| {
            OrchestratorError::AgentPool(format!("failed to create LLM client for '{name}': {e}"))
        })?;

        let snapshot = Agent {
            id: AgentId::new(),
            name: name.to_string(),
            persona,
            context,
            start_time: Utc::now(),
            estimated_cost: 0.0,
        };

        self.active.write().await.insert(
            snapshot.id.clone(),
            ActiveAgent {
                snapshot: snapshot.clone(),
                client,
                invoke_lock: Arc::new(Mutex::new(())),
                _permit: permit,
            },
        );

        self.events.emit(
            AgentEventType::Started,
            snapshot.id.clone(),
            name,
            Some(json!({ "task": snapshot.context.task_description })),
        );
        info!(agent = name, id = %snapshot.id, "agent created");
        Ok(snapshot)
    }

    async fn load_persona(&self, name: &str) -> Result<String> {
        if !self.config.agents_dir.is_dir() {
            return Err(OrchestratorError::AgentPool(format!(
                "missing agent configuration directory {}",
                self.config.agents_dir.display()
            )));
        }
        let path = self.config.agents_dir.join(format!("{name}.md"));
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            OrchestratorError::AgentPool(format!(
                "persona file not found for agent '{name}' at {}: {e}",
                path.display()
            ))
        })
    }

    /// Invoke the agent's bound client. Invocations on one agent serialise;
    /// failures emit `agent.error` and re-raise un-retried; retry policy
    /// belongs to the caller's retry handler.
    pub async fn invoke_agent(&self, agent_id: &AgentId, prompt: &str) -> Result<String> {
        let (client, invoke_lock, name) = {
            let active = self.active.read().await;
            let entry = active.get(agent_id).ok_or_else(|| {
                OrchestratorError::AgentPool(format!("no active agent with id {agent_id}"))
            })?;
            (
                entry.client.clone(),
                entry.invoke_lock.clone(),
                entry.snapshot.name.clone(),
            )
        };

        if let Some(tracker) = &self.config.cost_tracker {
            tracker.check(&name).await?;
        }

        let _serialised = invoke_lock.lock().await;
        let started = Instant::now();

        match client.invoke(prompt, None).await {
            Ok(response) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                let usage = client.get_token_usage();
                let cost = client.estimate_cost(&usage);

                {
                    let mut active = self.active.write().await;
                    if let Some(entry) = active.get_mut(agent_id) {
                        entry.snapshot.estimated_cost += cost;
                    }
                }
                {
                    let mut metrics = self.cost_metrics.write().await;
                    *metrics.entry(name.clone()).or_default() += cost;
                }
                if let Some(tracker) = &self.config.cost_tracker {
                    tracker.record(&name, cost).await;
                }

                self.events.emit(
                    AgentEventType::Invoked,
                    agent_id.clone(),
                    &name,
                    Some(json!({
                        "latencyMs": latency_ms,
                        "cost": cost,
                        "totalTokens": usage.total_tokens,
                    })),
                );
                Ok(response)
            }
            Err(error) => {
                self.events.emit(
                    AgentEventType::Error,
                    agent_id.clone(),
                    &name,
                    Some(json!({ "error": error.to_string() })),
                );
                Err(error)
            }
        }
    }

    /// Destroy an agent, emitting `agent.completed` and admitting the next
    /// queued waiter.
    pub async fn destroy_agent(&self, agent_id: &AgentId) -> Result<()> {
        let entry = self.active.write().await.remove(agent_id).ok_or_else(|| {
            OrchestratorError::AgentPool(format!("no active agent with id {agent_id}"))
        })?;

        let execution_ms = (Utc::now() - entry.snapshot.start_time).num_milliseconds();
        self.events.emit(
            AgentEventType::Completed,
            agent_id.clone(),
            &entry.snapshot.name,
            Some(json!({
                "executionTimeMs": execution_ms,
                "totalCost": entry.snapshot.estimated_cost,
            })),
        );
        debug!(id = %agent_id, "agent destroyed");
        // Dropping entry releases the permit and pumps the queue
        Ok(())
    }

    /// Snapshots of active agents, optionally filtered.
    pub async fn get_active_agents(&self, filter: Option<AgentFilter>) -> Vec<Agent> {
        let active = self.active.read().await;
        let mut agents: Vec<Agent> = active
            .values()
            .map(|entry| entry.snapshot.clone())
            .filter(|agent| {
                filter.as_ref().map_or(true, |f| {
                    f.name.as_ref().map_or(true, |n| &agent.name == n)
                        && f.started_after.map_or(true, |t| agent.start_time > t)
                })
            })
            .collect();
        agents.sort_by_key(|a| a.start_time);
        agents
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Accumulated estimated cost per agent role.
    pub async fn cost_metrics(&self) -> HashMap<String, f64> {
        self.cost_metrics.read().await.clone()
    }

    /// Destroy every active agent, fail queued waiters with a cancellation
    /// error, and stop background health checks.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.admission.close();

        let ids: Vec<AgentId> = self.active.read().await.keys().cloned().collect();
        futures::future::join_all(ids.iter().map(|id| self.destroy_agent(id))).await;
        info!("agent pool shut down");
    }

    fn spawn_reaper(pool: Weak<Self>, check: Duration, max_age: Duration) {
        tokio::spawn(async move {
            let mut ticker = interval(check);
            ticker.tick().await; // first tick fires immediately
            loop {
                let Some(pool) = pool.upgrade() else { return };
                tokio::select! {
                    _ = pool.shutdown_token.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let deadline = Utc::now()
                    - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
                let overdue: Vec<(AgentId, String)> = pool
                    .active
                    .read()
                    .await
                    .values()
                    .filter(|entry| entry.snapshot.start_time < deadline)
                    .map(|entry| (entry.snapshot.id.clone(), entry.snapshot.name.clone()))
                    .collect();

                for (id, name) in overdue {
                    warn!(agent = %name, id = %id, "destroying hung agent");
                    pool.events.emit(
                        AgentEventType::Error,
                        id.clone(),
                        &name,
                        Some(json!({ "status": "failed", "reason": "exceeded maxAgentExecutionTime" })),
                    );
                    let _ = pool.destroy_agent(&id).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockClientFactory, MockLLMClient, MockResponse};
    use std::sync::Arc;
    use tokio::time::sleep;

    struct Fixture {
        pool: Arc<AgentPool>,
        _dir: tempfile::TempDir,
    }

    fn fixture(max_concurrent: usize, client: Arc<MockLLMClient>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let agents_dir = dir.path().join("bmad").join("bmm").join("agents");
        std::fs::create_dir_all(&agents_dir).unwrap();
        for name in ["analyst", "architect", "dev"] {
            std::fs::write(
                agents_dir.join(format!("{name}.md")),
                format!("# {name}\nYou are the {name}."),
            )
            .unwrap();
        }

        let factory = Arc::new(MockClientFactory::new(client));
        let pool = AgentPool::new(
            AgentPoolConfig {
                agents_dir,
                max_concurrent_agents: max_concurrent,
                health_check_interval: None,
                max_agent_execution_time: None,
                cost_tracker: None,
            },
            factory,
        );
        Fixture { pool, _dir: dir }
    }

    fn context(task: &str) -> AgentContext {
        AgentContext {
            onboarding_docs: vec![],
            workflow_state: None,
            task_description: task.to_string(),
        }
    }

    #[tokio::test]
    async fn create_invoke_destroy_accumulates_cost_and_events() {
        let client = Arc::new(MockLLMClient::with_response("analysis complete"));
        let f = fixture(2, client);
        let mut events = f.pool.events().subscribe();

        let agent = f.pool.create_agent("analyst", context("analyse")).await.unwrap();
        assert!(agent.persona.contains("analyst"));

        let response = f.pool.invoke_agent(&agent.id, "go").await.unwrap();
        assert_eq!(response, "analysis complete");

        let costs = f.pool.cost_metrics().await;
        assert!(costs["analyst"] > 0.0);
        let snapshot = &f.pool.get_active_agents(None).await[0];
        assert!(snapshot.estimated_cost > 0.0);

        f.pool.destroy_agent(&agent.id).await.unwrap();
        assert_eq!(f.pool.active_count().await, 0);

        let kinds: Vec<AgentEventType> = [
            events.recv().await.unwrap().event,
            events.recv().await.unwrap().event,
            events.recv().await.unwrap().event,
        ]
        .to_vec();
        assert_eq!(
            kinds,
            vec![
                AgentEventType::Started,
                AgentEventType::Invoked,
                AgentEventType::Completed
            ]
        );
    }

    #[tokio::test]
    async fn admission_blocks_at_capacity_and_is_fifo() {
        let client = Arc::new(MockLLMClient::new());
        let f = fixture(2, client);

        let a = f.pool.create_agent("analyst", context("a")).await.unwrap();
        let _b = f.pool.create_agent("architect", context("b")).await.unwrap();
        assert_eq!(f.pool.active_count().await, 2);

        // Third creation must suspend until a slot frees
        let pool = f.pool.clone();
        let third = tokio::spawn(async move { pool.create_agent("dev", context("c")).await });
        sleep(Duration::from_millis(50)).await;
        assert!(!third.is_finished());
        assert_eq!(f.pool.active_count().await, 2);

        f.pool.destroy_agent(&a.id).await.unwrap();
        let admitted = third.await.unwrap().unwrap();
        assert_eq!(admitted.name, "dev");
        assert_eq!(f.pool.active_count().await, 2);
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_its_queue_slot() {
        let client = Arc::new(MockLLMClient::new());
        let f = fixture(1, client);

        let first = f.pool.create_agent("analyst", context("a")).await.unwrap();

        let pool = f.pool.clone();
        let waiter = tokio::spawn(async move { pool.create_agent("dev", context("b")).await });
        sleep(Duration::from_millis(30)).await;
        waiter.abort();
        let _ = waiter.await;

        // The aborted waiter must not consume the slot freed here
        f.pool.destroy_agent(&first.id).await.unwrap();
        let next = f.pool.create_agent("architect", context("c")).await.unwrap();
        assert_eq!(next.name, "architect");
    }

    #[tokio::test]
    async fn invocations_on_one_agent_serialise() {
        // A client that takes 100 ms per invocation
        struct Slow(MockLLMClient);
        #[async_trait::async_trait]
        impl LLMClient for Slow {
            async fn invoke(
                &self,
                prompt: &str,
                options: Option<crate::llm::InvokeOptions>,
            ) -> Result<String> {
                sleep(Duration::from_millis(100)).await;
                self.0.invoke(prompt, options).await
            }
            fn get_token_usage(&self) -> crate::llm::TokenUsage {
                self.0.get_token_usage()
            }
            fn estimate_cost(&self, usage: &crate::llm::TokenUsage) -> f64 {
                self.0.estimate_cost(usage)
            }
        }
        struct SlowFactory(Arc<Slow>);
        #[async_trait::async_trait]
        impl LLMClientFactory for SlowFactory {
            async fn create_client(&self, _agent_name: &str) -> Result<Arc<dyn LLMClient>> {
                Ok(self.0.clone() as Arc<dyn LLMClient>)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let agents_dir = dir.path().join("bmad").join("bmm").join("agents");
        std::fs::create_dir_all(&agents_dir).unwrap();
        std::fs::write(agents_dir.join("analyst.md"), "persona").unwrap();

        let pool = AgentPool::new(
            AgentPoolConfig {
                agents_dir,
                max_concurrent_agents: 2,
                health_check_interval: None,
                max_agent_execution_time: None,
                cost_tracker: None,
            },
            Arc::new(SlowFactory(Arc::new(Slow(MockLLMClient::with_response(
                "ok",
            ))))),
        );

        let agent = pool.create_agent("analyst", context("t")).await.unwrap();
        let started = Instant::now();
        let (r1, r2) = tokio::join!(
            pool.invoke_agent(&agent.id, "one"),
            pool.invoke_agent(&agent.id, "two"),
        );
        r1.unwrap();
        r2.unwrap();
        // Two serialised 100 ms invocations cannot finish in under 200 ms
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn unknown_ids_are_pool_errors() {
        let client = Arc::new(MockLLMClient::new());
        let f = fixture(2, client);
        let ghost = AgentId::from("ghost");

        assert!(matches!(
            f.pool.invoke_agent(&ghost, "x").await.unwrap_err(),
            OrchestratorError::AgentPool(_)
        ));
        assert!(matches!(
            f.pool.destroy_agent(&ghost).await.unwrap_err(),
            OrchestratorError::AgentPool(_)
        ));
    }

    #[tokio::test]
    async fn missing_persona_is_a_pool_error() {
        let client = Arc::new(MockLLMClient::new());
        let f = fixture(2, client);
        let err = f
            .pool
            .create_agent("nonexistent-role", context("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("persona file not found"));
    }

    #[tokio::test]
    async fn failed_client_creation_does_not_leak_the_slot() {
        let client = Arc::new(MockLLMClient::new());
        let f = fixture(1, client);
        let factory_error = {
            let dir = f._dir.path().join("bmad").join("bmm").join("agents");
            let factory = Arc::new(MockClientFactory::new(Arc::new(MockLLMClient::new())));
            factory.fail_creation_for("analyst");
            AgentPool::new(
                AgentPoolConfig {
                    agents_dir: dir,
                    max_concurrent_agents: 1,
                    health_check_interval: None,
                    max_agent_execution_time: None,
                    cost_tracker: None,
                },
                factory,
            )
        };

        assert!(factory_error
            .create_agent("analyst", context("x"))
            .await
            .is_err());
        // Slot was released; a healthy role can still be created
        let ok = factory_error.create_agent("dev", context("y")).await.unwrap();
        assert_eq!(ok.name, "dev");
    }

    #[tokio::test]
    async fn invoke_failure_emits_error_and_propagates() {
        let client = Arc::new(MockLLMClient::with_script(vec![MockResponse::Failure(
            "boom".to_string(),
        )]));
        let f = fixture(2, client);
        let mut events = f.pool.events().subscribe();

        let agent = f.pool.create_agent("analyst", context("x")).await.unwrap();
        assert!(f.pool.invoke_agent(&agent.id, "p").await.is_err());

        let started = events.recv().await.unwrap();
        assert_eq!(started.event, AgentEventType::Started);
        let errored = events.recv().await.unwrap();
        assert_eq!(errored.event, AgentEventType::Error);
    }

    #[tokio::test]
    async fn filters_select_by_name_and_start_time() {
        let client = Arc::new(MockLLMClient::new());
        let f = fixture(3, client);

        let before = Utc::now();
        let _a = f.pool.create_agent("analyst", context("a")).await.unwrap();
        let _b = f.pool.create_agent("dev", context("b")).await.unwrap();

        let named = f
            .pool
            .get_active_agents(Some(AgentFilter {
                name: Some("dev".to_string()),
                started_after: None,
            }))
            .await;
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].name, "dev");

        let recent = f
            .pool
            .get_active_agents(Some(AgentFilter {
                name: None,
                started_after: Some(before),
            }))
            .await;
        assert_eq!(recent.len(), 2);

        let none = f
            .pool
            .get_active_agents(Some(AgentFilter {
                name: None,
                started_after: Some(Utc::now()),
            }))
            .await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn shutdown_fails_queued_waiters_and_clears_active() {
        let client = Arc::new(MockLLMClient::new());
        let f = fixture(1, client);

        let _held = f.pool.create_agent("analyst", context("a")).await.unwrap();
        let pool = f.pool.clone();
        let waiter = tokio::spawn(async move { pool.create_agent("dev", context("b")).await });
        sleep(Duration::from_millis(30)).await;

        f.pool.shutdown().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled(_)));
        assert_eq!(f.pool.active_count().await, 0);
    }

    #[tokio::test]
    async fn exhausted_budget_blocks_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let agents_dir = dir.path().join("bmad").join("bmm").join("agents");
        std::fs::create_dir_all(&agents_dir).unwrap();
        std::fs::write(agents_dir.join("analyst.md"), "persona").unwrap();

        let tracker = Arc::new(
            crate::llm::CostTracker::new().with_daily_budget(crate::llm::Budget::new(1e-9)),
        );
        let pool = AgentPool::new(
            AgentPoolConfig {
                cost_tracker: Some(tracker.clone()),
                ..AgentPoolConfig::for_project(dir.path())
            },
            Arc::new(MockClientFactory::new(Arc::new(MockLLMClient::with_response("ok")))),
        );

        let agent = pool.create_agent("analyst", context("t")).await.unwrap();
        // First invocation passes (nothing spent yet), second is refused
        pool.invoke_agent(&agent.id, "one").await.unwrap();
        let err = pool.invoke_agent(&agent.id, "two").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn reaper_destroys_hung_agents() {
        let dir = tempfile::tempdir().unwrap();
        let agents_dir = dir.path().join("bmad").join("bmm").join("agents");
        std::fs::create_dir_all(&agents_dir).unwrap();
        std::fs::write(agents_dir.join("analyst.md"), "persona").unwrap();

        let factory = Arc::new(MockClientFactory::new(Arc::new(MockLLMClient::new())));
        let pool = AgentPool::new(
            AgentPoolConfig {
                agents_dir,
                max_concurrent_agents: 2,
                health_check_interval: Some(Duration::from_millis(25)),
                max_agent_execution_time: Some(Duration::from_millis(50)),
                cost_tracker: None,
            },
            factory,
        );

        let _agent = pool.create_agent("analyst", context("hang")).await.unwrap();
        assert_eq!(pool.active_count().await, 1);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.active_count().await, 0);
    }
}
