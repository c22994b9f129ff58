//! The shipped configuration must load and validate.

use std::path::PathBuf;

use gensrv::core::register_map::DecodeKind;
use gensrv::AppConfig;

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config/gensrv.yaml")
}

#[test]
fn test_shipped_config_is_valid() {
    let config = AppConfig::load(shipped_config()).expect("Test: load");
    config.validate().expect("Test: valid");

    assert_eq!(config.enabled_channels().count(), 1);
    let channel = config.enabled_channels().next().expect("Test: channel");
    assert_eq!(channel.id, "15002");

    let map = config.register_map(&channel.model).expect("Test: map");
    let outputs = map.output_names();
    assert!(outputs.contains(&"rede_ok"));
    assert!(outputs.contains(&"horas_trabalhadas"));
    assert!(!outputs.contains(&"status"));

    let counters = map
        .blocks
        .iter()
        .find(|b| b.name == "contadores")
        .expect("Test: counters block");
    assert_eq!(counters.fields[0].kind, DecodeKind::U32Pair);
}

#[test]
fn test_shipped_config_publish_test_reading() {
    let config = AppConfig::load(shipped_config()).expect("Test: load");
    let map = config.register_map("k30xl").expect("Test: map");

    let reading = map.decode_zeroed("15002");
    assert_eq!(reading.len(), map.output_names().len());
    assert_eq!(reading.get("rede_ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(reading.get("rpm_motor").and_then(|v| v.as_f64()), Some(0.0));
}
