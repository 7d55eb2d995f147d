use conductor_core::config::ModelConfig;

/// Model settings pointing at a non-routable endpoint.
pub fn test_model_config() -> ModelConfig {
    ModelConfig {
        provider: "proxy".into(),
        model_id: "test-model".into(),
        endpoint: Some("http://127.0.0.1:9/complete".into()),
        api_key: None,
        max_tokens: 512,
        temperature: 0.0,
        retry: None,
    }
}

/// start → agent(`agent_id`) → end, as workflow JSON.
pub fn linear_workflow_json(agent_id: &str) -> String {
    serde_json::json!({
        "id": "wf-linear",
        "name": "Linear",
        "version": "1.0.0",
        "nodes": [
            {"id": "start", "type": "start", "position": {"x": 0.0, "y": 0.0}},
            {"id": "work", "type": "agent", "agentId": agent_id, "position": {"x": 200.0, "y": 0.0}},
            {"id": "end", "type": "end", "position": {"x": 400.0, "y": 0.0}}
        ],
        "edges": [
            {"id": "e1", "source": "start", "target": "work"},
            {"id": "e2", "source": "work", "target": "end"}
        ]
    })
    .to_string()
}
