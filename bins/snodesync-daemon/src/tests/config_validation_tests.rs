use super::*;

#[test]
fn default_test_config_is_valid() {
    assert!(test_config().validate().is_ok());
}

#[test]
fn account_key_must_be_hex() {
    let mut cfg = test_config();
    cfg.identity.account_key = "alice".to_string();
    assert!(matches!(
        cfg.validate(),
        Err(config::ConfigError::Invalid(field)) if field == "identity.account_key"
    ));
}

#[test]
fn seed_url_needs_an_http_scheme() {
    let mut cfg = test_config();
    cfg.seed.url = "seed.test".to_string();
    assert!(cfg.validate().is_err());
    cfg.seed.url = "http://seed.test".to_string();
    assert!(cfg.validate().is_ok());
}

#[test]
fn zero_limits_are_rejected() {
    let mut cfg = test_config();
    cfg.seed.limit = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = test_config();
    cfg.refresh.interval_secs = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn bind_address_must_parse() {
    let mut cfg = test_config();
    cfg.api.bind_addr = "localhost".to_string();
    assert!(matches!(
        cfg.validate(),
        Err(config::ConfigError::Invalid(field)) if field == "api.bind_addr"
    ));
}
