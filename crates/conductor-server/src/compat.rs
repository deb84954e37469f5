//! Accept camelCase parameter names from clients that send them.

/// camelCase → snake_case parameter renames.
const CAMEL_TO_SNAKE: &[(&str, &str)] = &[
    ("agentRunId", "agent_run_id"),
    ("runId", "run_id"),
    ("parentId", "parent_id"),
    ("orchestratorId", "orchestrator_id"),
    ("waitForCompletion", "wait_for_completion"),
    ("timeoutSecs", "timeout_secs"),
];

/// Rename known camelCase keys to snake_case. When both spellings are
/// present the snake_case value wins.
pub fn normalize_params(params: &serde_json::Value) -> serde_json::Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = obj.clone();
    for &(camel, snake) in CAMEL_TO_SNAKE {
        if result.contains_key(snake) {
            let _ = result.remove(camel);
        } else if let Some(val) = result.remove(camel) {
            let _ = result.insert(snake.to_string(), val);
        }
    }
    serde_json::Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renames_camel_case_keys() {
        let out = normalize_params(&json!({"agentRunId": 5, "waitForCompletion": true, "query": "q"}));
        assert_eq!(out, json!({"agent_run_id": 5, "wait_for_completion": true, "query": "q"}));
    }

    #[test]
    fn snake_case_wins_over_duplicate() {
        let out = normalize_params(&json!({"parentId": 1, "parent_id": 2}));
        assert_eq!(out, json!({"parent_id": 2}));
    }

    #[test]
    fn non_objects_pass_through() {
        assert_eq!(normalize_params(&json!([1, 2])), json!([1, 2]));
    }
}
