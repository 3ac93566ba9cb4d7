use agent_continuity::AppError;

#[test]
fn display_prefixes_each_variant() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Db("locked".into()), "db: locked"),
        (AppError::Transport("bind".into()), "transport: bind"),
        (AppError::Protocol("frame".into()), "protocol: frame"),
        (AppError::Checkpoint("encode".into()), "checkpoint: encode"),
        (AppError::Integrity("mismatch".into()), "integrity: mismatch"),
        (AppError::Handoff("target".into()), "handoff: target"),
        (
            AppError::InvalidTransition("complete -> pending".into()),
            "invalid transition: complete -> pending",
        ),
        (AppError::Rotation("spawn".into()), "rotation: spawn"),
        (AppError::NotFound("checkpoint c1".into()), "not found: checkpoint c1"),
        (AppError::Io("eof".into()), "io: eof"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn toml_errors_map_to_config() {
    let err: AppError = toml::from_str::<toml::Value>("= nope")
        .unwrap_err()
        .into();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn json_errors_map_to_checkpoint() {
    let err: AppError = serde_json::from_str::<serde_json::Value>("{")
        .unwrap_err()
        .into();
    assert!(matches!(err, AppError::Checkpoint(msg) if msg.starts_with("serialization failed")));
}

#[test]
fn io_errors_map_to_io() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert_eq!(err, AppError::Io("gone".into()));
}
