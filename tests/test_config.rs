use std::collections::HashMap;

use ferry::config::Config;

fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
    let env: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(|key| env.get(key).cloned())
}

#[test]
fn test_config_defaults() {
    let cfg = load(&[]).unwrap();
    assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
    assert_eq!(cfg.target, "http://localhost:9200");
    assert_eq!(cfg.session_timeout_ms, 30_000);
    assert_eq!(cfg.pool.max_size_per_target, 50);
    assert!(cfg.retry_idempotent);
}

#[test]
fn test_config_port_from_env() {
    let cfg = load(&[("PORT", "8080")]).unwrap();
    assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
}

#[test]
fn test_config_listen_overrides_port() {
    let cfg = load(&[("PORT", "8080"), ("LISTEN", "127.0.0.1:8000")]).unwrap();
    assert_eq!(cfg.listen_addr, "127.0.0.1:8000");
}

#[test]
fn test_config_target_from_env() {
    let cfg = load(&[("TARGET", "http://10.0.0.5:8080/api")]).unwrap();
    let target = cfg.target().unwrap();
    assert_eq!(target.addr(), "10.0.0.5:8080");
    assert_eq!(target.request_path("/items"), "/api/items");
}

#[test]
fn test_config_numeric_overrides() {
    let cfg = load(&[
        ("FERRY_SESSION_TIMEOUT_MS", "1500"),
        ("FERRY_POOL_MAX_SIZE", "4"),
        ("FERRY_POOL_IDLE_TIMEOUT_MS", "250"),
    ])
    .unwrap();
    assert_eq!(cfg.session_timeout().as_millis(), 1500);
    assert_eq!(cfg.pool.max_size_per_target, 4);
    assert_eq!(cfg.pool.idle_timeout().as_millis(), 250);
}

#[test]
fn test_config_rejects_bad_port() {
    assert!(load(&[("PORT", "not-a-port")]).is_err());
    assert!(load(&[("PORT", "70000")]).is_err());
}

#[test]
fn test_config_accepts_tls_target() {
    let cfg = load(&[("TARGET", "https://example.com/api")]).unwrap();
    let target = cfg.target().unwrap();
    assert!(target.is_tls());
    assert_eq!(target.addr(), "example.com:443");
    assert!(cfg.tls.verify);
}

#[test]
fn test_config_tls_overrides() {
    let cfg = load(&[("FERRY_TLS_VERIFY", "false")]).unwrap();
    assert!(!cfg.tls.verify);

    let cfg = load(&[("FERRY_TLS_CA_PATH", "/etc/ferry/ca.pem")]).unwrap();
    assert_eq!(cfg.tls.ca_path.as_deref(), Some(std::path::Path::new("/etc/ferry/ca.pem")));

    assert!(load(&[("FERRY_TLS_VERIFY", "maybe")]).is_err());
    assert!(load(&[("FERRY_TLS_VERIFY", "false"), ("FERRY_TLS_CA_PATH", "/ca.pem")]).is_err());
}

#[test]
fn test_config_rejects_unknown_scheme() {
    assert!(load(&[("TARGET", "ftp://example.com")]).is_err());
}

#[test]
fn test_config_rejects_zero_pool_size() {
    assert!(load(&[("FERRY_POOL_MAX_SIZE", "0")]).is_err());
}

#[test]
fn test_config_from_yaml() {
    let cfg = Config::from_yaml(
        "listen_addr: 127.0.0.1:4000\n\
         target: http://backend:9000\n\
         forward_headers: false\n\
         pool:\n  max_size_per_target: 8\n\
         tls:\n  verify: false\n",
    )
    .unwrap();
    assert_eq!(cfg.listen_addr, "127.0.0.1:4000");
    assert!(!cfg.forward_headers);
    assert_eq!(cfg.pool.max_size_per_target, 8);
    assert!(!cfg.tls.verify);
    // Unset fields keep their defaults
    assert_eq!(cfg.pool.connect_timeout_ms, 5_000);
    assert_eq!(cfg.session_timeout_ms, 30_000);
}

#[test]
fn test_config_yaml_rejects_unknown_fields() {
    assert!(Config::from_yaml("listen: 127.0.0.1:4000\n").is_err());
}

#[test]
fn test_config_file_then_env() {
    let path = std::env::temp_dir().join(format!("ferry-config-{}.yaml", std::process::id()));
    std::fs::write(&path, "target: http://file-backend:9000\nsession_timeout_ms: 900\n").unwrap();

    let path_str = path.to_string_lossy().to_string();
    let cfg = load(&[("FERRY_CONFIG", &path_str), ("TARGET", "http://env-backend:9100")]).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(cfg.target, "http://env-backend:9100");
    assert_eq!(cfg.session_timeout_ms, 900);
}

#[test]
fn test_config_missing_file() {
    assert!(load(&[("FERRY_CONFIG", "/nonexistent/ferry.yaml")]).is_err());
}

#[test]
fn test_config_clone() {
    let cfg1 = load(&[]).unwrap();
    let cfg2 = cfg1.clone();
    assert_eq!(cfg1.listen_addr, cfg2.listen_addr);
}
