use rhs_can_open::{config::ConfigError, CanOpenConfig};

/// A board file overriding some of the service tunables
#[test]
fn test_board_config() {
    const CFG: &str = r#"
        # Slow bus, give remote nodes more time
        sdo_timeout_ms = 2500
        tx_attempts = 5
        tx_retry_delay_ms = 2
    "#;

    let cfg = CanOpenConfig::load_from_str(CFG).expect("Failed to parse CAN-open config");
    assert_eq!(
        CanOpenConfig {
            sdo_timeout_ms: 2500,
            rx_queue_len: 32,
            tx_queue_len: 32,
            tx_attempts: 5,
            tx_retry_delay_ms: 2,
        },
        cfg
    );
}

#[test]
fn test_load_from_file() {
    let path = std::env::temp_dir().join(format!("rhs_can_open_{}.toml", std::process::id()));
    std::fs::write(&path, "rx_queue_len = 4\ntx_queue_len = 8\n").unwrap();
    let cfg = CanOpenConfig::load_from_file(&path);
    std::fs::remove_file(&path).ok();

    let cfg = cfg.expect("Failed to load CAN-open config");
    assert_eq!(4, cfg.rx_queue_len);
    assert_eq!(8, cfg.tx_queue_len);
    assert_eq!(1000, cfg.sdo_timeout_ms);
}

#[test]
fn test_wrong_type_is_parse_error() {
    let err = CanOpenConfig::load_from_str("sdo_timeout_ms = \"fast\"").unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().starts_with("Error parsing CAN-open config"));
}
