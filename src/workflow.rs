use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::error::WorkflowError;
use crate::generation::{GENERATION_CAPABILITY, Generator};
use crate::retrieval::{CONTEXT_SEARCH_CAPABILITY, ContextSearch, run_retrieval_stage};
use crate::router::run_planner_stage;
use crate::state::{Citation, Operation, Trace, WorkflowState};
use crate::synthesis::run_synthesis_stage;
use crate::tools::weather::{ForecastProvider, Geocoder};
use crate::tools::{ToolExecutor, ToolName, ToolResult, run_tool_stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Planner,
    Retrieval,
    Tool,
    Synthesis,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Planner => "planner",
            Stage::Retrieval => "retrieval",
            Stage::Tool => "tool",
            Stage::Synthesis => "synthesis",
        }
    }
}

pub type RouteFn = fn(&WorkflowState) -> Stage;

#[derive(Debug, Clone)]
enum Transition {
    Edge(Stage),
    Conditional { route: RouteFn, targets: Vec<Stage> },
    End,
}

impl Transition {
    fn targets(&self) -> Vec<Stage> {
        match self {
            Transition::Edge(to) => vec![*to],
            Transition::Conditional { targets, .. } => targets.clone(),
            Transition::End => Vec::new(),
        }
    }
}

/// Branch taken after the planner: tool runs go to the tool stage, everything else retrieves.
pub fn route_after_planner(state: &WorkflowState) -> Stage {
    match state.operation() {
        Operation::Tool => Stage::Tool,
        Operation::Rag | Operation::Unset => Stage::Retrieval,
    }
}

#[derive(Debug, Default)]
pub struct WorkflowGraphBuilder {
    entry: Option<Stage>,
    transitions: BTreeMap<Stage, Transition>,
    duplicates: Vec<Stage>,
}

impl WorkflowGraphBuilder {
    pub fn entry(mut self, stage: Stage) -> Self {
        self.entry = Some(stage);
        self
    }

    pub fn edge(self, from: Stage, to: Stage) -> Self {
        self.insert(from, Transition::Edge(to))
    }

    pub fn conditional_edge(
        self,
        from: Stage,
        route: RouteFn,
        targets: impl IntoIterator<Item = Stage>,
    ) -> Self {
        let targets = targets.into_iter().collect();
        self.insert(from, Transition::Conditional { route, targets })
    }

    pub fn end(self, from: Stage) -> Self {
        self.insert(from, Transition::End)
    }

    fn insert(mut self, from: Stage, transition: Transition) -> Self {
        if self.transitions.insert(from, transition).is_some() {
            self.duplicates.push(from);
        }
        self
    }

    /// Validates the topology: one entry, one outgoing transition per reachable
    /// stage, no cycles.
    pub fn build(self) -> Result<WorkflowGraph, WorkflowError> {
        let entry = self
            .entry
            .ok_or_else(|| WorkflowError::InvalidGraph("no entry stage".to_string()))?;
        if let Some(stage) = self.duplicates.first() {
            return Err(WorkflowError::InvalidGraph(format!(
                "stage '{}' has more than one outgoing transition",
                stage.label()
            )));
        }
        for (from, transition) in &self.transitions {
            if let Transition::Conditional { targets, .. } = transition
                && targets.is_empty()
            {
                return Err(WorkflowError::InvalidGraph(format!(
                    "conditional edge from '{}' declares no targets",
                    from.label()
                )));
            }
        }

        let mut visiting = BTreeSet::new();
        let max_path_len = longest_path(entry, &self.transitions, &mut visiting)?;
        Ok(WorkflowGraph {
            entry,
            transitions: self.transitions,
            max_path_len,
        })
    }
}

fn longest_path(
    stage: Stage,
    transitions: &BTreeMap<Stage, Transition>,
    visiting: &mut BTreeSet<Stage>,
) -> Result<usize, WorkflowError> {
    if !visiting.insert(stage) {
        return Err(WorkflowError::InvalidGraph(format!(
            "cycle through stage '{}'",
            stage.label()
        )));
    }
    let transition = transitions.get(&stage).ok_or_else(|| {
        WorkflowError::InvalidGraph(format!(
            "stage '{}' has no outgoing transition",
            stage.label()
        ))
    })?;

    let mut longest = 0;
    for target in transition.targets() {
        longest = longest.max(longest_path(target, transitions, visiting)?);
    }
    visiting.remove(&stage);
    Ok(longest + 1)
}

/// Validated, acyclic stage graph. Immutable after construction.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    entry: Stage,
    transitions: BTreeMap<Stage, Transition>,
    max_path_len: usize,
}

impl WorkflowGraph {
    pub fn builder() -> WorkflowGraphBuilder {
        WorkflowGraphBuilder::default()
    }

    /// Planner → {Retrieval | Tool} → Synthesis → END.
    pub fn standard() -> Result<Self, WorkflowError> {
        Self::builder()
            .entry(Stage::Planner)
            .conditional_edge(
                Stage::Planner,
                route_after_planner,
                [Stage::Retrieval, Stage::Tool],
            )
            .edge(Stage::Retrieval, Stage::Synthesis)
            .edge(Stage::Tool, Stage::Synthesis)
            .end(Stage::Synthesis)
            .build()
    }

    pub fn entry(&self) -> Stage {
        self.entry
    }

    /// Number of stages on the longest path from the entry to END.
    pub fn max_path_len(&self) -> usize {
        self.max_path_len
    }

    /// Next stage after `stage`, or `None` at END.
    pub fn next(&self, stage: Stage, state: &WorkflowState) -> Result<Option<Stage>, WorkflowError> {
        let transition = self.transitions.get(&stage).ok_or_else(|| {
            WorkflowError::InvalidGraph(format!("unknown stage '{}'", stage.label()))
        })?;
        match transition {
            Transition::Edge(to) => Ok(Some(*to)),
            Transition::End => Ok(None),
            Transition::Conditional { route, targets } => {
                let chosen = route(state);
                if !targets.contains(&chosen) {
                    return Err(WorkflowError::InvalidGraph(format!(
                        "route from '{}' chose undeclared stage '{}'",
                        stage.label(),
                        chosen.label()
                    )));
                }
                Ok(Some(chosen))
            }
        }
    }
}

/// Capability handles the orchestrator is built with. Missing rag capabilities
/// only fail when a rag run needs them (or at `ensure_ready`).
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub context_search: Option<Arc<dyn ContextSearch>>,
    pub generator: Option<Arc<dyn Generator>>,
    pub geocoder: Arc<dyn Geocoder>,
    pub forecast: Arc<dyn ForecastProvider>,
}

/// Caller-facing result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub operation: Operation,
    pub plan: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub trace: Trace,
    pub tool_name: Option<ToolName>,
    pub tool_result: Option<ToolResult>,
}

impl QueryResponse {
    fn from_state(state: WorkflowState) -> Self {
        let query = state.user_query().to_string();
        let operation = state.operation();
        let plan = state.plan.clone();
        let answer = state.final_answer.clone();
        let citations = state.citations.clone();
        let tool_name = state.tool_name;
        let tool_result = state.tool_result.clone();
        Self {
            query,
            operation,
            plan,
            answer,
            citations,
            trace: state.into_trace(),
            tool_name,
            tool_result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub state: WorkflowState,
    pub path: Vec<Stage>,
}

/// Runs queries through the stage graph. Holds no per-query state, so one
/// instance can serve concurrent runs behind an `Arc`.
pub struct Orchestrator {
    graph: WorkflowGraph,
    context_search: Option<Arc<dyn ContextSearch>>,
    generator: Option<Arc<dyn Generator>>,
    tools: ToolExecutor,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self, WorkflowError> {
        Ok(Self {
            graph: WorkflowGraph::standard()?,
            context_search: config.context_search,
            generator: config.generator,
            tools: ToolExecutor::new(config.geocoder, config.forecast),
        })
    }

    /// Fails if either rag capability is missing.
    pub fn ensure_ready(&self) -> Result<(), WorkflowError> {
        if self.context_search.is_none() {
            return Err(WorkflowError::CapabilityNotInitialized(
                CONTEXT_SEARCH_CAPABILITY,
            ));
        }
        if self.generator.is_none() {
            return Err(WorkflowError::CapabilityNotInitialized(GENERATION_CAPABILITY));
        }
        Ok(())
    }

    pub fn tools(&self) -> &ToolExecutor {
        &self.tools
    }

    pub fn context_search_backend(&self) -> Option<&'static str> {
        self.context_search.as_ref().map(|search| search.backend_name())
    }

    pub fn generator_name(&self) -> Option<&str> {
        self.generator.as_ref().map(|generator| generator.name())
    }

    async fn execute_stage(
        &self,
        stage: Stage,
        state: &mut WorkflowState,
    ) -> Result<(), WorkflowError> {
        match stage {
            Stage::Planner => run_planner_stage(state),
            Stage::Retrieval => run_retrieval_stage(state, self.context_search.as_deref()),
            Stage::Tool => run_tool_stage(state, &self.tools).await,
            Stage::Synthesis => run_synthesis_stage(state, self.generator.as_deref()).await,
        }
    }

    pub async fn run(&self, query: &str) -> Result<CompletedRun, WorkflowError> {
        let mut state = WorkflowState::new(query);
        let mut path = Vec::with_capacity(self.graph.max_path_len());
        let mut stage = self.graph.entry();

        loop {
            if path.len() >= self.graph.max_path_len() {
                return Err(WorkflowError::InvalidGraph(format!(
                    "run exceeded {} stage executions",
                    self.graph.max_path_len()
                )));
            }
            tracing::debug!(stage = stage.label(), "executing stage");
            self.execute_stage(stage, &mut state).await?;
            path.push(stage);

            match self.graph.next(stage, &state)? {
                Some(next) => stage = next,
                None => break,
            }
        }

        tracing::info!(
            operation = %state.operation(),
            stages = path.len(),
            trace_entries = state.trace().len(),
            "workflow run completed"
        );
        Ok(CompletedRun { state, path })
    }

    pub async fn handle_query(&self, query: &str) -> Result<QueryResponse, WorkflowError> {
        let run = self.run(query).await?;
        Ok(QueryResponse::from_state(run.state))
    }
}
