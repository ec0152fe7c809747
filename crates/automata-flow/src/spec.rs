//! Flow specifications: the declarative JSON program Automata executes.
//!
//! A [`FlowSpec`] is a list of dependent [`StepDef`]s plus optional input
//! declarations, per-spec defaults and a failure hook. Specs are validated
//! once when a run initializes; validation failures carry the offending step
//! and field so the run error is actionable.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// The kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    /// Outbound HTTP call.
    Http,
    /// Cancellable sleep.
    Delay,
    /// Template-expansion pass-through for reshaping data between steps.
    Transform,
    /// Container of concurrently executing branches.
    Parallel,
}

impl StepType {
    /// Returns the lowercase wire name of the type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Delay => "delay",
            Self::Transform => "transform",
            Self::Parallel => "parallel",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy for a step (or for the whole spec via defaults).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    #[serde(default)]
    pub max_attempts: u32,
    /// Backoff strategy: `"fixed"` or `"exponential"`.
    #[serde(default)]
    pub backoff: String,
    /// Initial delay between attempts in milliseconds.
    #[serde(default)]
    pub initial_delay_ms: u64,
    /// Upper bound on the delay in milliseconds.
    #[serde(default)]
    pub max_delay_ms: u64,
    /// HTTP status codes that are retriable (http steps only).
    ///
    /// When set, a logical failure retries only if the response status code
    /// is in this list.
    #[serde(default)]
    pub on_status: Vec<u16>,
}

/// Defaults applied to every step unless overridden.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDefaults {
    /// Default retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Default execution timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
}

/// Declaration of a flow input parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDef {
    /// Parameter type: `"string"`, `"number"`, `"boolean"`, `"object"`.
    #[serde(rename = "type")]
    pub input_type: String,
    /// Whether the parameter must be supplied at run creation.
    #[serde(default)]
    pub required: bool,
    /// Default value used when the parameter is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A branch of a parallel step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Branch identifier, unique within the parallel step.
    pub id: String,
    /// Steps executed sequentially inside the branch.
    pub steps: Vec<StepDef>,
}

/// Definition of one step in a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    /// Step identifier, unique across the spec.
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// The kind of work this step performs.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Ids of steps that must complete before this one starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Template expression gating execution; falsy skips the step.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub condition: String,
    /// Type-specific configuration, rendered through the template engine
    /// at dispatch time.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Output mapping templates (name -> extraction expression).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub outputs: Map<String, Value>,
    /// Retry policy overriding the spec defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Timeout overriding the spec defaults, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    /// Concurrent branches (parallel steps only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
}

/// A parsed flow specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSpec {
    /// Spec format version, for forward compatibility.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Flow name (duplicates the owning flow's name for convenience).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Description of what the flow does.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Declared input parameters, keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputDef>,
    /// Defaults applied to every step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<StepDefaults>,
    /// The steps to execute.
    pub steps: Vec<StepDef>,
    /// Hook executed when the flow fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Box<StepDef>>,
}

/// Builds the fully-qualified id for a step inside a parallel branch.
#[must_use]
pub fn qualified_step_id(parallel_id: &str, branch_id: &str, step_id: &str) -> String {
    format!("{parallel_id}.{branch_id}.{step_id}")
}

/// Builds the synthetic join-node id for a parallel step.
#[must_use]
pub fn join_node_id(parallel_id: &str) -> String {
    format!("{parallel_id}.join")
}

impl FlowSpec {
    /// Parses a spec from its JSON representation.
    ///
    /// # Errors
    ///
    /// Returns a serialization error when the JSON does not match the spec
    /// shape. Parsing does not validate the program; call [`FlowSpec::validate`].
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validates the spec.
    ///
    /// Checks (in order): non-empty step list, non-empty and unique step ids
    /// (branch steps under their fully-qualified ids), no self-dependencies,
    /// well-formed parallel steps, and `depends_on` references resolving to
    /// known steps. Cycle detection is delegated to DAG construction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the offending step and field.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::validation("", "steps", "spec has no steps"));
        }

        let mut step_ids = HashSet::new();
        for step in &self.steps {
            validate_step(step, &mut step_ids)?;
        }

        validate_dependencies(&self.steps, &step_ids)?;

        if let Some(hook) = &self.on_failure {
            // The hook runs outside the DAG; it only needs to be well-formed
            // on its own.
            let mut hook_ids = step_ids.clone();
            validate_step(hook, &mut hook_ids)?;
        }

        Ok(())
    }

    /// Finds a step definition by id, including branch steps addressed by
    /// their fully-qualified `{parallel}.{branch}.{step}` id.
    #[must_use]
    pub fn find_step(&self, step_id: &str) -> Option<&StepDef> {
        for step in &self.steps {
            if step.id == step_id {
                return Some(step);
            }
            if step.step_type == StepType::Parallel {
                for branch in &step.branches {
                    for branch_step in &branch.steps {
                        if branch_step.id == step_id
                            || qualified_step_id(&step.id, &branch.id, &branch_step.id) == step_id
                        {
                            return Some(branch_step);
                        }
                    }
                }
            }
        }
        None
    }

    /// Resolves the effective retry policy for a step: step-level override
    /// first, then the spec defaults.
    #[must_use]
    pub fn retry_policy_for(&self, step_id: &str) -> Option<&RetryPolicy> {
        if let Some(step) = self.find_step(step_id) {
            if let Some(policy) = &step.retry {
                return Some(policy);
            }
        }
        self.defaults.as_ref().and_then(|d| d.retry.as_ref())
    }
}

fn validate_step(step: &StepDef, step_ids: &mut HashSet<String>) -> Result<()> {
    if step.id.is_empty() {
        return Err(Error::validation("", "id", "step has empty id"));
    }

    if !step_ids.insert(step.id.clone()) {
        return Err(Error::validation(
            &step.id,
            "id",
            format!("duplicate step id: {}", step.id),
        ));
    }

    for dep in &step.depends_on {
        if dep == &step.id {
            return Err(Error::validation(
                &step.id,
                "depends_on",
                "step depends on itself",
            ));
        }
    }

    if step.step_type == StepType::Parallel {
        validate_parallel_step(step, step_ids)?;
    }

    Ok(())
}

fn validate_parallel_step(step: &StepDef, step_ids: &mut HashSet<String>) -> Result<()> {
    if step.branches.is_empty() {
        return Err(Error::validation(
            &step.id,
            "branches",
            "parallel step has no branches",
        ));
    }

    let mut branch_ids = HashSet::new();
    for (i, branch) in step.branches.iter().enumerate() {
        if branch.id.is_empty() {
            return Err(Error::validation(
                &step.id,
                "branches",
                format!("branch {i} has empty id"),
            ));
        }
        if !branch_ids.insert(branch.id.clone()) {
            return Err(Error::validation(
                &step.id,
                "branches",
                format!("duplicate branch id: {}", branch.id),
            ));
        }
        if branch.steps.is_empty() {
            return Err(Error::validation(
                &step.id,
                "branches",
                format!("branch {} has no steps", branch.id),
            ));
        }

        for branch_step in &branch.steps {
            if branch_step.id.is_empty() {
                return Err(Error::validation(&step.id, "branches", "step has empty id"));
            }
            // Uniqueness is checked on the fully-qualified id, which is what
            // the DAG keys nodes on.
            let full_id = qualified_step_id(&step.id, &branch.id, &branch_step.id);
            let qualified = StepDef {
                id: full_id,
                ..branch_step.clone()
            };
            validate_step(&qualified, step_ids)?;
        }
    }

    Ok(())
}

fn validate_dependencies(steps: &[StepDef], step_ids: &HashSet<String>) -> Result<()> {
    for step in steps {
        for dep in &step.depends_on {
            if !step_ids.contains(dep) {
                return Err(Error::validation(
                    &step.id,
                    "depends_on",
                    format!("depends on unknown step: {dep}"),
                ));
            }
        }

        if step.step_type == StepType::Parallel {
            for branch in &step.branches {
                for branch_step in &branch.steps {
                    for dep in &branch_step.depends_on {
                        // Branch-local names resolve against the branch
                        // namespace first, then the flow-level one.
                        let local = qualified_step_id(&step.id, &branch.id, dep);
                        if !step_ids.contains(&local) && !step_ids.contains(dep) {
                            return Err(Error::validation(
                                &branch_step.id,
                                "depends_on",
                                format!("depends on unknown step: {dep}"),
                            ));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, step_type: StepType, depends_on: &[&str]) -> StepDef {
        StepDef {
            id: id.to_string(),
            name: String::new(),
            step_type,
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
            condition: String::new(),
            config: Map::new(),
            outputs: Map::new(),
            retry: None,
            timeout_sec: None,
            branches: Vec::new(),
        }
    }

    fn spec(steps: Vec<StepDef>) -> FlowSpec {
        FlowSpec {
            steps,
            ..FlowSpec::default()
        }
    }

    #[test]
    fn empty_spec_is_invalid() {
        let err = spec(vec![]).validate().unwrap_err();
        assert!(matches!(err, Error::Validation { field, .. } if field == "steps"));
    }

    #[test]
    fn linear_spec_is_valid() {
        let s = spec(vec![
            step("a", StepType::Http, &[]),
            step("b", StepType::Delay, &["a"]),
            step("c", StepType::Transform, &["b"]),
        ]);
        s.validate().unwrap();
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let s = spec(vec![
            step("a", StepType::Http, &[]),
            step("a", StepType::Delay, &[]),
        ]);
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn empty_step_id_is_rejected() {
        let s = spec(vec![step("", StepType::Http, &[])]);
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("empty id"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let s = spec(vec![step("a", StepType::Http, &["ghost"])]);
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("unknown step: ghost"));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let s = spec(vec![step("a", StepType::Http, &["a"])]);
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
    }

    #[test]
    fn parallel_without_branches_is_rejected() {
        let s = spec(vec![step("par", StepType::Parallel, &[])]);
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("no branches"));
    }

    #[test]
    fn duplicate_branch_id_is_rejected() {
        let mut par = step("par", StepType::Parallel, &[]);
        par.branches = vec![
            Branch {
                id: "x".into(),
                steps: vec![step("s1", StepType::Http, &[])],
            },
            Branch {
                id: "x".into(),
                steps: vec![step("s2", StepType::Http, &[])],
            },
        ];
        let err = spec(vec![par]).validate().unwrap_err();
        assert!(err.to_string().contains("duplicate branch id"));
    }

    #[test]
    fn branch_without_steps_is_rejected() {
        let mut par = step("par", StepType::Parallel, &[]);
        par.branches = vec![Branch {
            id: "x".into(),
            steps: vec![],
        }];
        let err = spec(vec![par]).validate().unwrap_err();
        assert!(err.to_string().contains("has no steps"));
    }

    #[test]
    fn branch_local_dependency_resolves() {
        let mut par = step("par", StepType::Parallel, &[]);
        par.branches = vec![Branch {
            id: "x".into(),
            steps: vec![
                step("s1", StepType::Http, &[]),
                step("s2", StepType::Http, &["s1"]),
            ],
        }];
        spec(vec![par]).validate().unwrap();
    }

    #[test]
    fn find_step_resolves_qualified_branch_ids() {
        let mut par = step("par", StepType::Parallel, &[]);
        par.branches = vec![Branch {
            id: "x".into(),
            steps: vec![step("s1", StepType::Delay, &[])],
        }];
        let s = spec(vec![step("a", StepType::Http, &[]), par]);

        assert_eq!(s.find_step("a").unwrap().id, "a");
        assert_eq!(s.find_step("par.x.s1").unwrap().id, "s1");
        assert!(s.find_step("par.y.s1").is_none());
    }

    #[test]
    fn retry_policy_prefers_step_override() {
        let mut a = step("a", StepType::Http, &[]);
        a.retry = Some(RetryPolicy {
            max_attempts: 5,
            ..RetryPolicy::default()
        });
        let mut s = spec(vec![a, step("b", StepType::Http, &[])]);
        s.defaults = Some(StepDefaults {
            retry: Some(RetryPolicy {
                max_attempts: 2,
                ..RetryPolicy::default()
            }),
            timeout_sec: None,
        });

        assert_eq!(s.retry_policy_for("a").unwrap().max_attempts, 5);
        assert_eq!(s.retry_policy_for("b").unwrap().max_attempts, 2);
    }

    #[test]
    fn spec_parses_from_json() {
        let json = r#"{
            "name": "sync-orders",
            "steps": [
                {"id": "fetch", "type": "http", "config": {"url": "https://example.com"}},
                {"id": "wait", "type": "delay", "depends_on": ["fetch"], "config": {"duration_sec": 2}}
            ],
            "defaults": {"retry": {"max_attempts": 3, "backoff": "exponential"}}
        }"#;
        let s = FlowSpec::from_json(json).unwrap();
        s.validate().unwrap();
        assert_eq!(s.steps.len(), 2);
        assert_eq!(s.steps[0].step_type, StepType::Http);
        assert_eq!(s.retry_policy_for("wait").unwrap().max_attempts, 3);
    }
}
