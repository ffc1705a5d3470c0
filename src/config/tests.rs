use super::types::*;
use super::GatewayConfig;
use std::path::Path;

#[test]
fn test_load_missing_file_uses_defaults() {
    let cfg = GatewayConfig::load(Path::new("/nonexistent/config.toml")).unwrap();
    assert!(!cfg.consul.address.is_empty());
    assert!(!cfg.etcd.endpoints.is_empty());
}

#[test]
fn test_load_toml_config() {
    let toml_str = r#"
[consul]
address = "http://consul.local:8500"

[etcd]
endpoints = ["http://etcd.local:2379"]
"#;
    let tmp = std::env::temp_dir().join("hermes_test_config.toml");
    std::fs::write(&tmp, toml_str).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.consul.address, "http://consul.local:8500");
    assert_eq!(cfg.etcd.endpoints, vec!["http://etcd.local:2379"]);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "consul": { "address": "http://127.0.0.1:8500" },
        "etcd": { "endpoints": ["http://127.0.0.1:2379"] }
    }"#;
    let tmp = std::env::temp_dir().join("hermes_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.consul.address, "http://127.0.0.1:8500");
    assert_eq!(cfg.etcd.endpoints, vec!["http://127.0.0.1:2379"]);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_validate_empty_etcd_endpoint_fails() {
    let cfg = GatewayConfig {
        etcd: EtcdConfig {
            endpoints: vec!["".into()],
            ..EtcdConfig::default()
        },
        ..GatewayConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_default_config_ok() {
    let cfg = GatewayConfig::default();
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_deserialize_defaults() {
    let toml_str = r#"
[consul]
address = "http://custom:8500"
"#;
    let cfg: GatewayConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(cfg.consul.address, "http://custom:8500");
    assert_eq!(cfg.consul.poll_interval_secs, 10);
    assert_eq!(cfg.etcd.route_prefix, "/hermes/routes");
    assert!(!cfg.registration.enabled);
    assert!(!cfg.instance_registry.enabled);
    assert_eq!(cfg.upstream_client.connect_timeout_secs, 6.0);
}

#[test]
fn test_unsupported_format() {
    let tmp = std::env::temp_dir().join("test.yml");
    std::fs::write(&tmp, "key: value").unwrap();
    assert!(GatewayConfig::load(&tmp).is_err());
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_env_override_route_prefix() {
    std::env::set_var("HERMES_ETCD_ROUTE_PREFIX", "/custom/routes");
    let mut cfg = GatewayConfig::default();
    cfg.apply_env_overrides();
    assert_eq!(cfg.etcd.route_prefix, "/custom/routes");
    std::env::remove_var("HERMES_ETCD_ROUTE_PREFIX");
}
