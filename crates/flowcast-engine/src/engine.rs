//! Chain Runner: the entry point the canvas drives.
//!
//! The engine owns the only mutable graph. Each dispatch reads a snapshot of
//! what it needs under the graph lock, releases it for every collaborator
//! call, and commits its result against the latest graph afterwards, so
//! triggers on disjoint nodes never interfere. Two triggers on the same node
//! race and the last commit wins, unless `reject_concurrent_triggers` is set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use flowcast_core::config::AppConfig;
use flowcast_core::error::{FlowError, Result};
use flowcast_core::event::EventBus;
use flowcast_core::traits::{GenerationClient, SnapshotSink, Stitcher};
use flowcast_core::types::*;

use crate::credits::CreditLedger;
use crate::dispatch::{DispatchInput, Dispatcher, NodeOutcome, Progress};
use crate::graph::{self, GraphStore, UpstreamContext};
use crate::history::HistoryStack;
use crate::persist::Persister;

/// Options for a single trigger.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Dispatch ancestors that lack a result (or failed) first.
    pub cascade: bool,
    /// Overrides the node's own prompt for this run only.
    pub custom_prompt: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cascade: true,
            custom_prompt: None,
        }
    }
}

/// What the canvas shows while a node runs.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeProgress {
    pub loading: bool,
    pub status: Option<String>,
    pub error: Option<String>,
}

pub struct Engine {
    graph: Arc<Mutex<GraphStore>>,
    history: Mutex<HistoryStack>,
    dispatcher: Dispatcher,
    ledger: CreditLedger,
    event_bus: Arc<EventBus>,
    sink: Option<Arc<dyn SnapshotSink>>,
    persister: Option<Persister>,
    in_flight: Mutex<HashMap<NodeId, usize>>,
    reject_concurrent: bool,
    persist_debounce: Duration,
}

impl Engine {
    pub fn new(
        config: &AppConfig,
        client: Arc<dyn GenerationClient>,
        stitcher: Arc<dyn Stitcher>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            graph: Arc::new(Mutex::new(GraphStore::new())),
            history: Mutex::new(HistoryStack::new(config.engine.history_limit)),
            dispatcher: Dispatcher::new(client, stitcher, config, event_bus.clone()),
            ledger: CreditLedger::new(
                config.credits.initial_balance,
                config.credits.tariff.clone(),
            ),
            event_bus,
            sink: None,
            persister: None,
            in_flight: Mutex::new(HashMap::new()),
            reject_concurrent: config.engine.reject_concurrent_triggers,
            persist_debounce: Duration::from_millis(config.engine.persist_debounce_ms),
        }
    }

    /// Replace the graph, e.g. with a loaded project. History is cleared.
    pub fn with_graph(self, snapshot: GraphSnapshot) -> Self {
        self.graph().replace(snapshot);
        self.history_stack().clear();
        self
    }

    /// Persist snapshots (debounced) and the credit balance through `sink`.
    /// Spawns the persister task, so this needs a tokio runtime.
    pub fn with_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.persister = Some(Persister::spawn(
            sink.clone(),
            self.persist_debounce,
            self.event_bus.clone(),
        ));
        self.sink = Some(sink);
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn credits(&self) -> &CreditLedger {
        &self.ledger
    }

    fn graph(&self) -> MutexGuard<'_, GraphStore> {
        self.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn history_stack(&self) -> MutexGuard<'_, HistoryStack> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Read access ──────────────────────────────────────────────

    pub fn snapshot(&self) -> GraphSnapshot {
        self.graph().snapshot()
    }

    pub fn node(&self, id: &str) -> Option<WorkflowNode> {
        self.graph().node(id).cloned()
    }

    pub fn node_progress(&self, id: &str) -> Option<NodeProgress> {
        self.graph().node(id).map(|n| NodeProgress {
            loading: n.data.loading,
            status: n.data.status.clone(),
            error: n.data.error.clone(),
        })
    }

    /// Execution order over the whole graph or the ancestors of `targets`.
    pub fn order(&self, targets: Option<&[NodeId]>) -> Vec<NodeId> {
        graph::order(&self.graph(), targets)
    }

    /// The upstream context `id` would be dispatched with right now.
    pub fn context(&self, id: &str) -> Result<UpstreamContext> {
        graph::collect(&self.graph(), id)
    }

    // ── Execution ────────────────────────────────────────────────

    /// Canvas entry point. A top-level trigger cascades through the node's
    /// ancestors; a sub-call dispatches only the node itself.
    pub async fn trigger(
        &self,
        id: &str,
        custom_prompt: Option<String>,
        is_sub_call: bool,
    ) -> Result<()> {
        self.run(
            id,
            RunOptions {
                cascade: !is_sub_call,
                custom_prompt,
            },
        )
        .await
    }

    /// Run `id`, first dispatching (in order, one at a time) every ancestor
    /// generation node that has no result or is in an error state. The first
    /// ancestor failure aborts the chain; committed ancestors are kept.
    pub async fn run(&self, id: &str, options: RunOptions) -> Result<()> {
        let node_type = self.graph().require(id)?.node_type;
        if !node_type.is_generation() {
            return Err(FlowError::UnsupportedNode(id.to_string()));
        }

        if options.cascade {
            let target = [id.to_string()];
            let order = self.order(Some(&target[..]));
            debug!(node_id = id, chain = ?order, "Cascade order");

            for ancestor in order.iter().filter(|a| a.as_str() != id) {
                let pending = match self.graph().node(ancestor) {
                    Some(node) if node.node_type.is_generation() => {
                        if node.data.loading {
                            let err = FlowError::UpstreamNotReady {
                                node: ancestor.clone(),
                            };
                            return Err(self.abort_chain(ancestor, err));
                        }
                        !node.has_result() || node.is_errored()
                    }
                    _ => false,
                };
                if !pending {
                    continue;
                }

                info!(node_id = id, ancestor = %ancestor, "Dispatching ancestor first");
                if let Err(e) = self.dispatch_node(ancestor, None).await {
                    return Err(self.abort_chain(ancestor, e));
                }
            }
        }

        self.dispatch_node(id, options.custom_prompt).await
    }

    /// Re-run every generation node in the graph in execution order.
    /// Returns the number of nodes dispatched.
    pub async fn run_all(&self) -> Result<usize> {
        let order = self.order(None);
        info!(nodes = order.len(), "Running whole graph");

        let mut dispatched = 0;
        for id in &order {
            let is_generation = self
                .graph()
                .node(id)
                .is_some_and(|n| n.node_type.is_generation());
            if !is_generation {
                continue;
            }
            if let Err(e) = self.dispatch_node(id, None).await {
                return Err(self.abort_chain(id, e));
            }
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn abort_chain(&self, node: &str, source: FlowError) -> FlowError {
        warn!(node_id = node, error = %source, "Chain aborted");
        self.event_bus.publish(EngineEvent::ChainAborted {
            node_id: node.to_string(),
            error: source.to_string(),
        });
        FlowError::ChainAborted {
            node: node.to_string(),
            source: Box::new(source),
        }
    }

    /// Dispatch a single node and commit the outcome.
    async fn dispatch_node(&self, id: &str, custom_prompt: Option<String>) -> Result<()> {
        let _guard = self.enter(id)?;
        let started = Instant::now();
        self.event_bus.publish(EngineEvent::NodeStarted {
            node_id: id.to_string(),
        });

        let result = match self.prepare(id, custom_prompt) {
            Ok((input, cost)) => {
                let progress = self.progress_sink(id);
                self.dispatcher
                    .dispatch(input, &progress)
                    .await
                    .map(|outcome| (outcome, cost))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok((outcome, cost)) => {
                self.commit(id, outcome, cost, started).await;
                Ok(())
            }
            Err(e) => {
                self.fail(id, &e);
                Err(e)
            }
        }
    }

    /// Admission, aggregation and the loading flag, atomically under the graph lock.
    fn prepare(&self, id: &str, custom_prompt: Option<String>) -> Result<(DispatchInput, u64)> {
        let mut graph = self.graph();
        let node = graph.require(id)?.clone();

        let cost = self.ledger.cost_of(node.node_type);
        self.ledger.check(cost)?;

        let context = graph::collect(&graph, id)?;
        let instruction = custom_prompt
            .filter(|p| !p.trim().is_empty())
            .or_else(|| node.data.prompt.clone());

        let references = context.reference_ids();
        graph.update_data(id, |d| {
            d.loading = true;
            d.error = None;
            d.status = Some("Queued".to_string());
            d.references = references;
        })?;

        info!(node_id = id, node_type = %node.node_type, cost, "Node dispatch started");
        Ok((
            DispatchInput {
                node,
                instruction,
                context,
            },
            cost,
        ))
    }

    fn progress_sink(&self, id: &str) -> impl Fn(Progress) + Send + Sync {
        let graph = self.graph.clone();
        let events = self.event_bus.clone();
        let node_id = id.to_string();
        move |progress: Progress| {
            let mut graph = graph.lock().unwrap_or_else(|e| e.into_inner());
            match progress {
                Progress::Status(status) => {
                    if let Err(e) = graph.update_data(&node_id, |d| d.status = Some(status.clone())) {
                        debug!(node_id = %node_id, error = %e, "Status update for removed node dropped");
                    }
                    events.publish(EngineEvent::NodeStatus {
                        node_id: node_id.clone(),
                        status,
                    });
                }
                Progress::Operation(handle) => {
                    if let Err(e) = graph.update_data(&node_id, |d| d.operation_id = handle) {
                        debug!(node_id = %node_id, error = %e, "Operation handle for removed node dropped");
                    }
                }
            }
        }
    }

    /// Apply a finished result and debit its cost. A node removed while its
    /// dispatch was in flight keeps nothing and costs nothing.
    async fn commit(&self, id: &str, outcome: NodeOutcome, cost: u64, started: Instant) {
        let snapshot = {
            let mut graph = self.graph();
            let applied = graph.update_data(id, |d| {
                outcome.apply(d);
                d.loading = false;
                d.operation_id = None;
            });
            if applied.is_err() {
                warn!(node_id = id, cost, "Node removed while running, result dropped");
                return;
            }
            graph.snapshot()
        };

        let balance = self.ledger.settle(cost);
        self.event_bus.publish(EngineEvent::CreditsDebited {
            node_id: id.to_string(),
            amount: cost,
            balance,
        });
        if let Some(ref sink) = self.sink {
            if let Err(e) = sink.persist_credits(balance).await {
                warn!(error = %e, "Failed to persist credit balance");
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(node_id = id, elapsed_ms, balance, "Node completed");
        self.event_bus.publish(EngineEvent::NodeCompleted {
            node_id: id.to_string(),
            elapsed_ms,
        });
        self.notify_persister(&snapshot);
    }

    /// Reset the node after a failed dispatch. Partial fan-out results survive.
    fn fail(&self, id: &str, err: &FlowError) {
        let message = describe(err);
        let snapshot = {
            let mut graph = self.graph();
            let reset = graph.update_data(id, |d| {
                d.clear_results();
                if let FlowError::PartialFailure { outputs, .. } = err {
                    d.outputs = outputs.clone();
                }
                d.loading = false;
                d.status = None;
                d.error = Some(message.clone());
            });
            if let Err(e) = reset {
                debug!(node_id = id, error = %e, "Failure for removed node not recorded");
            }
            graph.snapshot()
        };

        if err.is_user_fixable() {
            warn!(node_id = id, error = %err, "Node needs attention");
        } else {
            error!(node_id = id, error = %err, "Node failed");
        }
        self.event_bus.publish(EngineEvent::NodeFailed {
            node_id: id.to_string(),
            error: message,
        });
        self.notify_persister(&snapshot);
    }

    fn enter(&self, id: &str) -> Result<InFlight<'_>> {
        let mut running = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let count = running.entry(id.to_string()).or_insert(0);
        if *count > 0 {
            if self.reject_concurrent {
                return Err(FlowError::AlreadyRunning(id.to_string()));
            }
            warn!(node_id = id, "Node re-triggered while in flight, last write wins");
        }
        *count += 1;
        Ok(InFlight {
            set: &self.in_flight,
            id: id.to_string(),
        })
    }

    /// Whether `id` has a dispatch in flight.
    pub fn is_running(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|m| m.get(id).copied().unwrap_or(0) > 0)
            .unwrap_or(false)
    }

    // ── Graph mutation (undoable) ────────────────────────────────

    fn mutate<T>(&self, f: impl FnOnce(&mut GraphStore) -> Result<T>) -> Result<T> {
        let (value, snapshot) = {
            let mut graph = self.graph();
            let before = graph.snapshot().stripped();
            let value = f(&mut graph)?;
            self.history_stack().push(before);
            (value, graph.snapshot())
        };
        self.notify_persister(&snapshot);
        Ok(value)
    }

    pub fn add_node(&self, node: WorkflowNode) -> Result<()> {
        debug!(node_id = %node.id, node_type = %node.node_type, "Adding node");
        self.mutate(|g| g.add_node(node))
    }

    /// Remove a node and every link touching it.
    pub fn remove_node(&self, id: &str) -> Result<WorkflowNode> {
        self.mutate(|g| {
            g.remove_node(id)
                .ok_or_else(|| FlowError::NodeNotFound(id.to_string()))
        })
    }

    /// Returns `false` if the link already existed.
    pub fn connect(&self, source: &str, target: &str) -> Result<bool> {
        self.mutate(|g| g.connect(source, target))
    }

    pub fn disconnect(&self, source: &str, target: &str) -> Result<bool> {
        self.mutate(|g| Ok(g.disconnect(source, target)))
    }

    pub fn set_prompt(&self, id: &str, prompt: impl Into<String>) -> Result<()> {
        let prompt = prompt.into();
        self.mutate(|g| g.update_data(id, |d| d.prompt = Some(prompt)))
    }

    pub fn undo(&self) -> bool {
        self.step_history(|h, current| h.undo(current))
    }

    pub fn redo(&self) -> bool {
        self.step_history(|h, current| h.redo(current))
    }

    fn step_history(
        &self,
        step: impl FnOnce(&mut HistoryStack, GraphSnapshot) -> Option<GraphSnapshot>,
    ) -> bool {
        let snapshot = {
            let mut graph = self.graph();
            let current = graph.snapshot().stripped();
            let Some(restored) = step(&mut self.history_stack(), current) else {
                return false;
            };
            graph.replace(restored);
            graph.snapshot()
        };
        self.notify_persister(&snapshot);
        true
    }

    pub fn can_undo(&self) -> bool {
        self.history_stack().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history_stack().can_redo()
    }

    fn notify_persister(&self, snapshot: &GraphSnapshot) {
        if let Some(ref persister) = self.persister {
            persister.notify(snapshot);
        }
    }

    /// Flush pending persistence and stop background tasks.
    pub async fn shutdown(&self) {
        if let Some(ref persister) = self.persister {
            persister.shutdown().await;
        }
    }
}

struct InFlight<'a> {
    set: &'a Mutex<HashMap<NodeId, usize>>,
    id: NodeId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut running = self.set.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = running.get_mut(&self.id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                running.remove(&self.id);
            }
        }
    }
}

/// User-facing message for a node error.
pub fn describe(err: &FlowError) -> String {
    match err {
        FlowError::Quota { .. } => format!(
            "{}. The generation quota is used up; upgrade the billing plan or try again later.",
            err
        ),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcast_test_utils::{fixtures, png_data_uri, MockGenerationClient, MockStitcher, RecordingSink};

    fn engine_with(config: &AppConfig, mock: Arc<MockGenerationClient>, graph: GraphSnapshot) -> Engine {
        Engine::new(
            config,
            mock,
            Arc::new(MockStitcher::ok()),
            Arc::new(EventBus::default()),
        )
        .with_graph(graph)
    }

    fn engine(mock: Arc<MockGenerationClient>, graph: GraphSnapshot) -> Engine {
        engine_with(&AppConfig::default(), mock, graph)
    }

    fn single_image_gen() -> GraphSnapshot {
        GraphSnapshot {
            nodes: vec![WorkflowNode::new("g", NodeType::ImageGen).with_prompt("A lighthouse at dusk")],
            edges: vec![],
        }
    }

    #[tokio::test]
    async fn test_cascade_runs_missing_ancestor_first() {
        let mock = Arc::new(MockGenerationClient::new());
        mock.push_response(Ok(GenerateResponse::text("A matte black sneaker on white")));
        let engine = engine(mock.clone(), fixtures::analysis_chain());

        engine.trigger("C", None, false).await.unwrap();

        let models = AppConfig::default().models;
        let calls = mock.generate_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].model, models.analysis);
        assert_eq!(calls[1].model, models.image);
        assert!(calls[1].prompt.contains("matte black sneaker"));
        assert_eq!(calls[1].images.len(), 1);

        assert!(engine.node("B").unwrap().has_result());
        let c = engine.node("C").unwrap();
        assert!(c.has_result());
        assert!(!c.data.loading);
        assert_eq!(engine.credits().balance(), 100 - 1 - 2);
    }

    #[tokio::test]
    async fn test_cascade_skips_ancestors_with_results() {
        let mock = Arc::new(MockGenerationClient::new());
        let engine = engine(mock.clone(), fixtures::analysis_chain());
        engine.trigger("C", None, false).await.unwrap();
        engine.trigger("C", None, false).await.unwrap();

        assert_eq!(mock.generate_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_sub_call_does_not_cascade() {
        let mock = Arc::new(MockGenerationClient::new());
        let engine = engine(mock.clone(), fixtures::analysis_chain());

        engine.trigger("C", None, true).await.unwrap();

        assert_eq!(mock.generate_calls().len(), 1);
        assert!(!engine.node("B").unwrap().has_result());
    }

    #[tokio::test]
    async fn test_ancestor_failure_aborts_chain() {
        let mock = Arc::new(MockGenerationClient::new());
        mock.push_response(Err(FlowError::Transport("connection reset".into())));
        let engine = engine(mock.clone(), fixtures::analysis_chain());
        let mut rx = engine.event_bus().subscribe();

        let err = engine.trigger("C", None, false).await.unwrap_err();
        match &err {
            FlowError::ChainAborted { node, source } => {
                assert_eq!(node, "B");
                assert!(matches!(**source, FlowError::Transport(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(mock.generate_calls().len(), 1);
        let b = engine.node("B").unwrap();
        assert!(!b.data.loading);
        assert!(b.data.error.as_deref().unwrap().contains("connection reset"));
        let c = engine.node("C").unwrap();
        assert!(c.data.error.is_none());
        assert!(!c.has_result());
        assert_eq!(engine.credits().balance(), 100);

        let mut aborted = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::ChainAborted { ref node_id, .. } if node_id == "B") {
                aborted = true;
            }
        }
        assert!(aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_cooldowns_then_success() {
        let mock = Arc::new(MockGenerationClient::new());
        for _ in 0..4 {
            mock.push_response(Err(FlowError::Quota {
                attempts: 1,
                message: "RESOURCE_EXHAUSTED".into(),
            }));
        }
        let engine = engine(mock.clone(), single_image_gen());
        let mut rx = engine.event_bus().subscribe();

        let started = tokio::time::Instant::now();
        engine.trigger("g", None, false).await.unwrap();

        assert_eq!(mock.generate_calls().len(), 5);
        assert!(started.elapsed() >= Duration::from_secs(240));
        assert!(engine.node("g").unwrap().has_result());
        assert_eq!(engine.credits().balance(), 98);

        let mut cooldowns = 0;
        let mut debits = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                EngineEvent::QuotaCooldown { .. } => cooldowns += 1,
                EngineEvent::CreditsDebited { amount, .. } => {
                    assert_eq!(amount, 2);
                    debits += 1;
                }
                _ => {}
            }
        }
        assert_eq!(cooldowns, 4);
        assert_eq!(debits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_fanout_keeps_finished_formats_on_node() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mock = Arc::new(MockGenerationClient::new());
        let served = AtomicUsize::new(0);
        mock.respond_with(move |_| {
            if served.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(GenerateResponse::image(png_data_uri(32, 32, [9, 9, 9, 255])))
            } else {
                Err(FlowError::Quota {
                    attempts: 1,
                    message: "RESOURCE_EXHAUSTED".into(),
                })
            }
        });
        let engine = engine(mock.clone(), fixtures::ad_fanout(4));

        let err = engine.trigger("ads", None, true).await.unwrap_err();
        assert!(matches!(
            err,
            FlowError::PartialFailure {
                completed: 2,
                total: 4,
                ..
            }
        ));

        let ads = engine.node("ads").unwrap();
        assert_eq!(ads.data.outputs.len(), 2);
        assert!(!ads.data.loading);
        assert!(ads.data.status.is_none());
        assert!(ads.data.error.is_some());
        assert_eq!(engine.credits().balance(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exhaustion_resets_node_with_billing_hint() {
        let mock = Arc::new(MockGenerationClient::new());
        mock.respond_with(|_| {
            Err(FlowError::Quota {
                attempts: 1,
                message: "429".into(),
            })
        });
        let mut graph = single_image_gen();
        graph.nodes[0].data.output = Some(png_data_uri(8, 8, [1, 2, 3, 255]));
        let engine = engine(mock.clone(), graph);

        let err = engine.trigger("g", None, false).await.unwrap_err();
        assert!(matches!(err, FlowError::Quota { attempts: 5, .. }));

        let g = engine.node("g").unwrap();
        assert!(!g.data.loading);
        assert!(g.data.output.is_none());
        assert!(g.data.error.as_deref().unwrap().contains("billing"));
        assert_eq!(engine.credits().balance(), 100);
    }

    #[tokio::test]
    async fn test_insufficient_credits_makes_no_calls() {
        let mock = Arc::new(MockGenerationClient::new());
        let engine = engine(mock.clone(), single_image_gen());
        engine.credits().restore(1);

        let err = engine.trigger("g", None, false).await.unwrap_err();
        assert!(matches!(
            err,
            FlowError::InsufficientCredits {
                required: 2,
                balance: 1
            }
        ));
        assert!(mock.generate_calls().is_empty());
        let progress = engine.node_progress("g").unwrap();
        assert!(!progress.loading);
        assert!(progress.error.is_some());
    }

    #[tokio::test]
    async fn test_custom_prompt_overrides_node_prompt() {
        let mock = Arc::new(MockGenerationClient::new());
        let engine = engine(mock.clone(), single_image_gen());

        engine
            .trigger("g", Some("A lighthouse in fog".into()), true)
            .await
            .unwrap();

        let prompt = &mock.prompts()[0];
        assert!(prompt.contains("in fog"));
        assert!(!prompt.contains("at dusk"));
        assert_eq!(
            engine.node("g").unwrap().data.prompt.as_deref(),
            Some("A lighthouse at dusk")
        );
    }

    #[tokio::test]
    async fn test_non_generation_target_is_rejected() {
        let engine = engine(Arc::new(MockGenerationClient::new()), fixtures::analysis_chain());
        assert!(matches!(
            engine.trigger("A", None, false).await,
            Err(FlowError::UnsupportedNode(_))
        ));
        assert!(matches!(
            engine.trigger("missing", None, false).await,
            Err(FlowError::NodeNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_trigger_rejected_when_configured() {
        let mut config = AppConfig::default();
        config.engine.reject_concurrent_triggers = true;
        let mock = Arc::new(MockGenerationClient::new().with_latency(Duration::from_secs(5)));
        let engine = engine_with(&config, mock.clone(), single_image_gen());

        let (first, second) = tokio::join!(
            engine.trigger("g", None, true),
            engine.trigger("g", None, true)
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(FlowError::AlreadyRunning(_))));
        assert_eq!(mock.generate_calls().len(), 1);
        assert!(!engine.is_running("g"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_trigger_last_write_wins_by_default() {
        let mock = Arc::new(MockGenerationClient::new().with_latency(Duration::from_secs(5)));
        let engine = engine(mock.clone(), single_image_gen());

        let (first, second) = tokio::join!(
            engine.trigger("g", None, true),
            engine.trigger("g", None, true)
        );
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(mock.generate_calls().len(), 2);
        assert!(!engine.node("g").unwrap().data.loading);
        assert_eq!(engine.credits().balance(), 96);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_removed_mid_run_is_not_charged() {
        let mock = Arc::new(MockGenerationClient::new().with_latency(Duration::from_secs(5)));
        let engine = engine(mock.clone(), single_image_gen());
        let mut rx = engine.event_bus().subscribe();

        let (outcome, removed) = tokio::join!(engine.trigger("g", None, true), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            engine.remove_node("g")
        });
        assert!(outcome.is_ok());
        assert!(removed.is_ok());
        assert_eq!(mock.generate_calls().len(), 1);
        assert!(engine.node("g").is_none());
        assert_eq!(engine.credits().balance(), 100);

        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(
                    event,
                    EngineEvent::CreditsDebited { .. } | EngineEvent::NodeCompleted { .. }
                ),
                "unexpected {:?}",
                event
            );
        }
    }

    #[test]
    fn test_progress_for_removed_node_is_ignored() {
        let engine = engine(Arc::new(MockGenerationClient::new()), single_image_gen());
        let mut rx = engine.event_bus().subscribe();
        let progress = engine.progress_sink("g");
        engine.remove_node("g").unwrap();

        progress(Progress::Status("Rendering clip 1/1".into()));
        progress(Progress::Operation(Some("operations/7".into())));

        assert!(engine.snapshot().nodes.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::NodeStatus { ref node_id, .. }) if node_id == "g"
        ));
    }

    #[tokio::test]
    async fn test_run_all_follows_dependency_order() {
        let mock = Arc::new(MockGenerationClient::new());
        let engine = engine(mock.clone(), fixtures::analysis_chain());

        assert_eq!(engine.run_all().await.unwrap(), 2);
        let models = AppConfig::default().models;
        let called: Vec<String> = mock.generate_calls().into_iter().map(|c| c.model).collect();
        assert_eq!(called, vec![models.analysis, models.image]);
    }

    #[test]
    fn test_undo_redo_graph_edits() {
        let engine = engine(Arc::new(MockGenerationClient::new()), GraphSnapshot::default());

        engine.add_node(WorkflowNode::new("t", NodeType::TextInput)).unwrap();
        engine.add_node(WorkflowNode::new("g", NodeType::TextGen)).unwrap();
        assert!(engine.connect("t", "g").unwrap());
        assert!(matches!(
            engine.add_node(WorkflowNode::new("t", NodeType::TextInput)),
            Err(FlowError::DuplicateNode(_))
        ));

        assert!(engine.undo());
        assert!(engine.snapshot().edges.is_empty());
        assert!(engine.undo());
        assert_eq!(engine.snapshot().nodes.len(), 1);

        assert!(engine.redo());
        assert_eq!(engine.snapshot().nodes.len(), 2);
        assert!(engine.can_redo());

        engine.set_prompt("g", "Summarize").unwrap();
        assert!(!engine.can_redo());
        assert_eq!(engine.node("g").unwrap().data.prompt.as_deref(), Some("Summarize"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_and_balance_reach_the_sink() {
        let mock = Arc::new(MockGenerationClient::new());
        let sink = Arc::new(RecordingSink::new());
        let engine = engine(mock, single_image_gen()).with_sink(sink.clone());

        engine.trigger("g", None, false).await.unwrap();
        engine.shutdown().await;

        assert_eq!(sink.balances(), vec![98]);
        let saved = sink.snapshots();
        let last = saved.last().unwrap();
        assert!(last.nodes[0].has_result());
        assert!(!last.nodes[0].data.loading);
    }
}
