// build.rs

use std::env;

fn main() -> anyhow::Result<()> {
    // Necessary because of this issue: https://github.com/rust-lang/cargo/issues/9641
    // see also https://github.com/rust-lang/cargo/issues/9554
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::build::CfgArgs::output_propagated("ESP_IDF")?;
        embuild::build::LinkArgs::output_propagated("ESP_IDF")?;
    }

    build_data::set_BUILD_TIMESTAMP();
    build_data::no_debug_rebuilds();

    let defaults = [
        ("DEVICE_NAME", "fan_controller"),
        ("WIFI_SSID", ""),
        ("WIFI_PASS", ""),
        ("MQTT_SERVER", "mqtt.local"),
        ("MQTT_PORT", "1883"),
        ("MQTT_USER", ""),
        ("MQTT_PASS", ""),
        ("MQTT_TOPIC", "airflow"),
        ("AP_SSID", "Fan_AP"),
        ("AP_PASS", "fan_setup$123"),
    ];

    for (name, default) in defaults {
        let value = env::var(name).unwrap_or_else(|_| default.into());
        println!("cargo:rustc-env={name}={value}");
        println!("cargo:rerun-if-env-changed={name}");
    }

    Ok(())
}

// EOF
