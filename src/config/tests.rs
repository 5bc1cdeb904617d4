use super::*;

#[test]
fn default_config_is_sane() {
    let config = Config::default();
    assert_eq!(config.component, ComponentKind::Translate);
    assert!(config.translation.enabled);
    assert_eq!(config.keepalive.keepalive_ms, 240_000);
    assert_eq!(config.keepalive.auto_exit_ms, 600_000);
    assert_eq!(config.routing.long_context_threshold, 60_000);
}

#[test]
fn component_kind_round_trips_through_str() {
    for kind in [
        ComponentKind::Translate,
        ComponentKind::Sanitize,
        ComponentKind::Keepalive,
        ComponentKind::Routing,
    ] {
        assert_eq!(ComponentKind::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(ComponentKind::parse("bogus"), None);
}

#[test]
fn to_toml_contains_all_sections() {
    let toml = Config::default().to_toml();
    assert!(toml.contains("[logging]"));
    assert!(toml.contains("[translation]"));
    assert!(toml.contains("[keepalive]"));
    assert!(toml.contains("[routing]"));
    assert!(toml.contains("[sanitize]"));
}
