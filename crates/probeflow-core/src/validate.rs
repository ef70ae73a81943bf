//! Upfront structural validation of a scenario against its servers.
//!
//! Every id the walk can follow must resolve to a live entity before
//! execution starts: the start step, edge endpoints, branch targets,
//! loop/group children, and request server references. Violations surface
//! as a terminal `failed` result, never a panic.

use std::collections::{HashMap, HashSet};

use probeflow_types::scenario::{Branch, Scenario, StepConfig};
use probeflow_types::server::Server;
use thiserror::Error;

/// Structural violations that prevent an execution from starting.
#[derive(Debug, Clone, Error)]
pub enum ScenarioError {
    #[error("start step '{0}' does not exist")]
    StartStepMissing(String),

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("edge '{edge_id}' references unknown step '{step_id}'")]
    EdgeEndpointMissing { edge_id: String, step_id: String },

    #[error("branch '{branch_id}' of step '{step_id}' targets unknown step '{target}'")]
    BranchTargetMissing {
        step_id: String,
        branch_id: String,
        target: String,
    },

    #[error("step '{step_id}' references unknown child step '{child}'")]
    ChildMissing { step_id: String, child: String },

    #[error("request step '{step_id}' references unknown server '{server_id}'")]
    ServerMissing { step_id: String, server_id: String },

    #[error("condition step '{0}' needs at least two branches")]
    TooFewBranches(String),
}

/// Validate every reference the walk can follow.
///
/// Returns the first violation found, mirroring the order of the checks
/// below: unique ids, start step, edges, per-step payloads.
pub fn validate_scenario(
    scenario: &Scenario,
    servers: &HashMap<String, Server>,
) -> Result<(), ScenarioError> {
    let mut step_ids = HashSet::new();
    for step in &scenario.steps {
        if !step_ids.insert(step.id.as_str()) {
            return Err(ScenarioError::DuplicateStepId(step.id.clone()));
        }
    }

    if !step_ids.contains(scenario.start_step_id.as_str()) {
        return Err(ScenarioError::StartStepMissing(scenario.start_step_id.clone()));
    }

    for edge in &scenario.edges {
        for endpoint in [&edge.source_step_id, &edge.target_step_id] {
            if !step_ids.contains(endpoint.as_str()) {
                return Err(ScenarioError::EdgeEndpointMissing {
                    edge_id: edge.id.clone(),
                    step_id: endpoint.clone(),
                });
            }
        }
    }

    for step in &scenario.steps {
        match &step.config {
            StepConfig::Request(request) => {
                if !servers.contains_key(&request.server_id) {
                    return Err(ScenarioError::ServerMissing {
                        step_id: step.id.clone(),
                        server_id: request.server_id.clone(),
                    });
                }
                check_branches(&step.id, &request.branches, &step_ids)?;
            }
            StepConfig::Condition { branches } => {
                if branches.len() < 2 {
                    return Err(ScenarioError::TooFewBranches(step.id.clone()));
                }
                check_branches(&step.id, branches, &step_ids)?;
            }
            StepConfig::Loop { steps, .. } | StepConfig::Group { steps } => {
                for child in steps {
                    if !step_ids.contains(child.as_str()) {
                        return Err(ScenarioError::ChildMissing {
                            step_id: step.id.clone(),
                            child: child.clone(),
                        });
                    }
                }
            }
        }
    }

    Ok(())
}

fn check_branches(
    step_id: &str,
    branches: &[Branch],
    step_ids: &HashSet<&str>,
) -> Result<(), ScenarioError> {
    for branch in branches {
        if !step_ids.contains(branch.next_step_id.as_str()) {
            return Err(ScenarioError::BranchTargetMissing {
                step_id: step_id.to_string(),
                branch_id: branch.id.clone(),
                target: branch.next_step_id.clone(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use probeflow_types::scenario::{
        Edge, ExecutionMode, HttpMethod, RequestConfig, Step,
    };

    fn server_map() -> HashMap<String, Server> {
        HashMap::from([(
            "srv".to_string(),
            Server {
                id: "srv".to_string(),
                name: "API".to_string(),
                base_url: "http://api".to_string(),
                headers: vec![],
                timeout_ms: 30_000,
            },
        )])
    }

    fn request_step(id: &str) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            execution_mode: ExecutionMode::Auto,
            delay_ms: None,
            condition: None,
            position: None,
            config: StepConfig::Request(RequestConfig {
                server_id: "srv".to_string(),
                method: HttpMethod::Get,
                endpoint: "/x".to_string(),
                headers: vec![],
                body: None,
                query_params: HashMap::new(),
                wait_for_response: true,
                save_response: false,
                response_alias: None,
                timeout_ms: None,
                branches: vec![],
                retry: None,
            }),
        }
    }

    fn scenario(steps: Vec<Step>, edges: Vec<Edge>, start: &str) -> Scenario {
        Scenario {
            id: "sc".to_string(),
            name: "sc".to_string(),
            version: "1".to_string(),
            server_ids: vec!["srv".to_string()],
            steps,
            edges,
            start_step_id: start.to_string(),
            parameter_schema: None,
            tags: vec![],
        }
    }

    #[test]
    fn test_valid_scenario_passes() {
        let sc = scenario(
            vec![request_step("a"), request_step("b")],
            vec![Edge {
                id: "e".to_string(),
                source_step_id: "a".to_string(),
                target_step_id: "b".to_string(),
                source_handle: None,
            }],
            "a",
        );
        assert!(validate_scenario(&sc, &server_map()).is_ok());
    }

    #[test]
    fn test_missing_start_step_detected() {
        let sc = scenario(vec![request_step("a")], vec![], "nope");
        let err = validate_scenario(&sc, &server_map()).unwrap_err();
        assert!(matches!(err, ScenarioError::StartStepMissing(id) if id == "nope"));
    }

    #[test]
    fn test_duplicate_step_ids_detected() {
        let sc = scenario(vec![request_step("a"), request_step("a")], vec![], "a");
        let err = validate_scenario(&sc, &server_map()).unwrap_err();
        assert!(matches!(err, ScenarioError::DuplicateStepId(_)));
    }

    #[test]
    fn test_dangling_edge_detected() {
        let sc = scenario(
            vec![request_step("a")],
            vec![Edge {
                id: "e".to_string(),
                source_step_id: "a".to_string(),
                target_step_id: "ghost".to_string(),
                source_handle: None,
            }],
            "a",
        );
        let err = validate_scenario(&sc, &server_map()).unwrap_err();
        assert!(matches!(err, ScenarioError::EdgeEndpointMissing { .. }));
    }

    #[test]
    fn test_unknown_server_detected() {
        let sc = scenario(vec![request_step("a")], vec![], "a");
        let err = validate_scenario(&sc, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ScenarioError::ServerMissing { .. }));
    }

    #[test]
    fn test_condition_step_needs_two_branches() {
        let mut step = request_step("c");
        step.config = StepConfig::Condition { branches: vec![] };
        let sc = scenario(vec![step], vec![], "c");
        let err = validate_scenario(&sc, &server_map()).unwrap_err();
        assert!(matches!(err, ScenarioError::TooFewBranches(_)));
    }

    #[test]
    fn test_loop_child_must_exist() {
        let mut step = request_step("l");
        step.config = StepConfig::Loop {
            descriptor: probeflow_types::scenario::LoopKind::Count {
                count: serde_json::json!(1),
                max_iterations: None,
            },
            steps: vec!["ghost".to_string()],
        };
        let sc = scenario(vec![step], vec![], "l");
        let err = validate_scenario(&sc, &server_map()).unwrap_err();
        assert!(matches!(err, ScenarioError::ChildMissing { .. }));
    }
}
