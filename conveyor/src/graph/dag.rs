//! Immutable dependency graph of a pipeline's jobs.
//!
//! Edges come from two places: each job's explicit `needs`, and the stage
//! barrier that makes every job depend on every job of the closest earlier
//! non-empty stage.

use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

use super::{JobExecutionSpec, PipelineDefinition};
use crate::core::JobStatus;
use crate::errors::ConfigurationError;

#[allow(clippy::expect_used)]
fn job_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("job id pattern compiles"))
}

/// A job and its resolved dependency set.
#[derive(Debug, Clone)]
pub struct JobNode {
    /// Job id.
    pub id: String,
    /// Stage name as declared.
    pub stage: String,
    /// Position of the stage, `None` when the stage is not declared.
    pub stage_ordinal: Option<usize>,
    /// Position of the job in the definition.
    pub declaration_index: usize,
    /// Explicit and implicit dependencies.
    pub dependencies: BTreeSet<String>,
    /// How the job runs.
    pub execution: JobExecutionSpec,
}

/// A stage and the jobs it contains.
#[derive(Debug, Clone)]
pub struct StageNode {
    /// Stage name.
    pub name: String,
    /// Position in the pipeline.
    pub ordinal: usize,
    /// Contained jobs in declaration order.
    pub jobs: Vec<String>,
    /// Per-stage override of the continue-on-failure policy.
    pub continue_on_failure: Option<bool>,
}

/// Result of a readiness computation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadySet {
    /// Pending jobs whose dependencies all succeeded, in dispatch order.
    pub ready: Vec<String>,
    /// Pending jobs that can never run because a dependency failed.
    pub doomed: Vec<String>,
}

impl ReadySet {
    /// Returns true if nothing became ready or doomed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.doomed.is_empty()
    }
}

/// A directed acyclic graph of jobs.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    definition: PipelineDefinition,
    stages: Vec<StageNode>,
    nodes: Vec<JobNode>,
    index: HashMap<String, usize>,
    dependents: HashMap<String, BTreeSet<String>>,
    dispatch_order: Vec<usize>,
    duplicate_stages: Vec<String>,
    duplicate_jobs: Vec<String>,
}

impl DependencyGraph {
    /// Builds the graph without validating it.
    ///
    /// Call [`DependencyGraph::validate`] before scheduling anything.
    #[must_use]
    pub fn from_definition(definition: &PipelineDefinition) -> Self {
        let mut stages: Vec<StageNode> = Vec::new();
        let mut stage_ordinals: HashMap<String, usize> = HashMap::new();
        let mut duplicate_stages = Vec::new();

        for stage in &definition.stages {
            if stage_ordinals.contains_key(&stage.name) {
                duplicate_stages.push(stage.name.clone());
                continue;
            }
            stage_ordinals.insert(stage.name.clone(), stages.len());
            stages.push(StageNode {
                name: stage.name.clone(),
                ordinal: stages.len(),
                jobs: Vec::new(),
                continue_on_failure: stage.continue_on_failure,
            });
        }

        let mut nodes: Vec<JobNode> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut duplicate_jobs = Vec::new();

        for (declaration_index, job) in definition.jobs.iter().enumerate() {
            if index.contains_key(&job.id) {
                duplicate_jobs.push(job.id.clone());
                continue;
            }
            let stage_ordinal = stage_ordinals.get(&job.stage).copied();
            if let Some(ordinal) = stage_ordinal {
                stages[ordinal].jobs.push(job.id.clone());
            }
            index.insert(job.id.clone(), nodes.len());
            nodes.push(JobNode {
                id: job.id.clone(),
                stage: job.stage.clone(),
                stage_ordinal,
                declaration_index,
                dependencies: job.needs.iter().cloned().collect(),
                execution: job.execution.clone(),
            });
        }

        // Stage barrier: depend on the closest earlier stage that has jobs.
        for node in &mut nodes {
            let Some(ordinal) = node.stage_ordinal else {
                continue;
            };
            if let Some(previous) = stages[..ordinal].iter().rev().find(|s| !s.jobs.is_empty()) {
                node.dependencies.extend(previous.jobs.iter().cloned());
            }
        }

        let mut dependents: HashMap<String, BTreeSet<String>> = HashMap::new();
        for node in &nodes {
            for dep in &node.dependencies {
                if index.contains_key(dep) {
                    dependents
                        .entry(dep.clone())
                        .or_default()
                        .insert(node.id.clone());
                }
            }
        }

        let mut dispatch_order: Vec<usize> = (0..nodes.len()).collect();
        dispatch_order.sort_by_key(|&i| {
            (
                nodes[i].stage_ordinal.unwrap_or(usize::MAX),
                nodes[i].declaration_index,
            )
        });

        Self {
            definition: definition.clone(),
            stages,
            nodes,
            index,
            dependents,
            dispatch_order,
            duplicate_stages,
            duplicate_jobs,
        }
    }

    /// Checks the graph is schedulable.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for an empty pipeline, duplicate
    /// names, malformed jobs, jobs in an undeclared stage, unknown
    /// dependencies, or a dependency cycle.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.nodes.is_empty() {
            return Err(ConfigurationError::empty(&self.definition.name));
        }
        if let Some(name) = self.duplicate_stages.first() {
            return Err(ConfigurationError::duplicate("stage", name));
        }
        if let Some(name) = self.duplicate_jobs.first() {
            return Err(ConfigurationError::duplicate("job", name));
        }

        for node in &self.nodes {
            if !job_id_pattern().is_match(&node.id) {
                return Err(ConfigurationError::invalid_job(
                    &node.id,
                    "job ids must start with a letter or digit and contain only letters, digits, '_', '.' or '-'",
                ));
            }
            if node.execution.image.trim().is_empty() {
                return Err(ConfigurationError::invalid_job(&node.id, "image must not be empty"));
            }
            if node.stage_ordinal.is_none() {
                return Err(ConfigurationError::orphan_job(&node.id, &node.stage));
            }
        }

        for node in &self.nodes {
            for dep in &node.dependencies {
                if !self.index.contains_key(dep) {
                    return Err(ConfigurationError::unknown_dependency(&node.id, dep));
                }
            }
        }

        self.detect_cycles()
    }

    /// Computes which pending jobs can be dispatched and which can never run.
    ///
    /// Jobs missing from `statuses` are treated as pending.
    #[must_use]
    pub fn ready_set(&self, statuses: &HashMap<String, JobStatus>) -> ReadySet {
        let status_of =
            |id: &str| statuses.get(id).copied().unwrap_or(JobStatus::Pending);
        let mut blocked: HashMap<String, bool> = HashMap::new();
        let mut result = ReadySet::default();

        for &i in &self.dispatch_order {
            let node = &self.nodes[i];
            if status_of(&node.id) != JobStatus::Pending {
                continue;
            }
            if self.is_blocked(&node.id, &status_of, &mut blocked) {
                result.doomed.push(node.id.clone());
            } else if node
                .dependencies
                .iter()
                .all(|dep| self.index.contains_key(dep) && status_of(dep) == JobStatus::Succeeded)
            {
                result.ready.push(node.id.clone());
            }
        }

        result
    }

    /// Returns true if the job's dependency chain contains a failed or canceled job.
    fn is_blocked(
        &self,
        id: &str,
        status_of: &impl Fn(&str) -> JobStatus,
        memo: &mut HashMap<String, bool>,
    ) -> bool {
        if let Some(&known) = memo.get(id) {
            return known;
        }
        // Provisional answer guards against revisiting a node mid-walk.
        memo.insert(id.to_string(), false);

        let Some(node) = self.node(id) else {
            return false;
        };
        let mut blocked = false;
        for dep in &node.dependencies {
            if !self.index.contains_key(dep) {
                continue;
            }
            let status = status_of(dep);
            if status.blocks_dependents()
                || (status != JobStatus::Succeeded && self.is_blocked(dep, status_of, memo))
            {
                blocked = true;
                break;
            }
        }

        memo.insert(id.to_string(), blocked);
        blocked
    }

    /// Returns every job that transitively depends on `job`.
    #[must_use]
    pub fn descendants(&self, job: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([job]);

        while let Some(current) = queue.pop_front() {
            if let Some(children) = self.dependents.get(current) {
                for child in children {
                    if seen.insert(child.clone()) {
                        queue.push_back(child);
                    }
                }
            }
        }

        seen.remove(job);
        seen
    }

    /// Returns the other jobs of `job`'s stage.
    #[must_use]
    pub fn siblings(&self, job: &str) -> Vec<String> {
        self.node(job)
            .and_then(|n| n.stage_ordinal)
            .map(|ordinal| {
                self.stages[ordinal]
                    .jobs
                    .iter()
                    .filter(|id| id.as_str() != job)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether siblings keep running after a failure in `stage`.
    #[must_use]
    pub fn continues_on_failure(&self, stage: &str, default: bool) -> bool {
        self.stages
            .iter()
            .find(|s| s.name == stage)
            .and_then(|s| s.continue_on_failure)
            .unwrap_or(default)
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Returns the definition the graph was built from.
    #[must_use]
    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Returns the number of jobs.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns a job node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&JobNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Returns job nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &JobNode> {
        self.nodes.iter()
    }

    /// Returns stages in pipeline order.
    #[must_use]
    pub fn stages(&self) -> &[StageNode] {
        &self.stages
    }

    /// Returns job ids ordered by (stage ordinal, declaration order).
    pub fn dispatch_order(&self) -> impl Iterator<Item = &str> {
        self.dispatch_order.iter().map(|&i| self.nodes[i].id.as_str())
    }

    /// Returns the (stage ordinal, declaration index) sort key of a job.
    #[must_use]
    pub fn dispatch_rank(&self, id: &str) -> Option<(usize, usize)> {
        self.node(id)
            .map(|n| (n.stage_ordinal.unwrap_or(usize::MAX), n.declaration_index))
    }

    /// Returns a topological order, visiting jobs in declaration order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<String> {
        fn visit(
            graph: &DependencyGraph,
            id: &str,
            visited: &mut HashSet<String>,
            result: &mut Vec<String>,
        ) {
            if !visited.insert(id.to_string()) {
                return;
            }
            if let Some(node) = graph.node(id) {
                for dep in &node.dependencies {
                    visit(graph, dep, visited, result);
                }
                result.push(id.to_string());
            }
        }

        let mut visited = HashSet::new();
        let mut result = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            visit(self, &node.id, &mut visited, &mut result);
        }
        result
    }

    fn detect_cycles(&self) -> Result<(), ConfigurationError> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        for node in &self.nodes {
            if !visited.contains(&node.id) {
                if let Some(cycle) = self.dfs_cycle(&node.id, &mut visited, &mut on_stack, &mut path) {
                    return Err(ConfigurationError::cycle(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        id: &str,
        visited: &mut HashSet<String>,
        on_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(id.to_string());
        on_stack.insert(id.to_string());
        path.push(id.to_string());

        if let Some(node) = self.node(id) {
            for dep in &node.dependencies {
                if !visited.contains(dep) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, on_stack, path) {
                        return Some(cycle);
                    }
                } else if on_stack.contains(dep) {
                    let start = path.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
            }
        }

        path.pop();
        on_stack.remove(id);
        None
    }
}
