use agent_continuity::config::RotationConfig;
use agent_continuity::models::checkpoint::TokenUsage;
use agent_continuity::orchestrator::rotation::{RotationPolicy, RotationResult, RotationStrategy};

#[test]
fn policy_follows_config() {
    let policy = RotationPolicy::from(&RotationConfig {
        context_window_tokens: 10_000,
        rotate_at_ratio: 0.5,
    });

    let usage = TokenUsage::new(2_000, 500);
    assert!((policy.usage_ratio(&usage) - 0.25).abs() < f64::EPSILON);
    assert!(!policy.needs_rotation(&usage));
    assert!(policy.needs_rotation(&TokenUsage::new(4_000, 1_000)));
}

#[test]
fn default_policy_rotates_near_window() {
    let policy = RotationPolicy::from(&RotationConfig::default());
    assert!(!policy.needs_rotation(&TokenUsage::new(170_000, 0)));
    assert!(policy.needs_rotation(&TokenUsage::new(170_000, 10_000)));
}

#[test]
fn saturated_usage_still_rotates() {
    let usage = TokenUsage::new(u64::MAX, 1);
    assert_eq!(usage.total_tokens, u64::MAX);
    assert!(RotationPolicy::from(&RotationConfig::default()).needs_rotation(&usage));
}

#[test]
fn strategies_roundtrip_by_name() {
    for strategy in [
        RotationStrategy::CheckpointAndRestart,
        RotationStrategy::FreshStart,
        RotationStrategy::SummarizeAndContinue,
    ] {
        let json = serde_json::to_value(strategy).expect("json");
        assert_eq!(json, serde_json::json!(strategy.as_str()));
        let back: RotationStrategy = serde_json::from_value(json).expect("parse");
        assert_eq!(back, strategy);
    }
}

#[test]
fn result_serializes_camel_case() {
    let result = RotationResult {
        success: true,
        strategy: RotationStrategy::FreshStart,
        old_agent_id: "old".into(),
        new_agent_id: Some("new".into()),
        checkpoint_id: None,
        error: None,
        warnings: vec!["slow shutdown".into()],
    };
    let json = serde_json::to_value(&result).expect("json");
    assert_eq!(json["oldAgentId"], "old");
    assert_eq!(json["newAgentId"], "new");
    assert_eq!(json["strategy"], "fresh_start");
    assert!(json["checkpointId"].is_null());
}
