// config.rs

// Compiled-in defaults. build.rs bakes these in from the build environment,
// the runtime values live in the settings store.

pub const DEFAULT_DEVICE_NAME: &str = match option_env!("DEVICE_NAME") {
    Some(v) => v,
    None => "fan_controller",
};
pub const DEFAULT_WIFI_SSID: &str = match option_env!("WIFI_SSID") {
    Some(v) => v,
    None => "",
};
pub const DEFAULT_WIFI_PASS: &str = match option_env!("WIFI_PASS") {
    Some(v) => v,
    None => "",
};
pub const DEFAULT_WIFI_TIMEOUT_SECS: u16 = 10;

pub const AP_SSID: &str = match option_env!("AP_SSID") {
    Some(v) => v,
    None => "Fan_AP",
};
pub const AP_PASS: &str = match option_env!("AP_PASS") {
    Some(v) => v,
    None => "fan_setup$123",
};
pub const AP_ADDRESS: [u8; 4] = [4, 3, 2, 1];
pub const AP_NETMASK_BITS: u8 = 24;

pub const DEFAULT_MQTT_SERVER: &str = match option_env!("MQTT_SERVER") {
    Some(v) => v,
    None => "mqtt.local",
};
pub const DEFAULT_MQTT_USER: &str = match option_env!("MQTT_USER") {
    Some(v) => v,
    None => "",
};
pub const DEFAULT_MQTT_PASS: &str = match option_env!("MQTT_PASS") {
    Some(v) => v,
    None => "",
};
pub const DEFAULT_MQTT_TOPIC: &str = match option_env!("MQTT_TOPIC") {
    Some(v) => v,
    None => "airflow",
};
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_TIMEOUT_SECS: u16 = 10;
pub const MQTT_BUFFER_SIZE: usize = 1280;
pub const MQTT_KEEP_ALIVE_SECS: u16 = 60;
pub const MQTT_SOCKET_TIMEOUT_SECS: u16 = 10;

pub const WIFI_CHECK_DELAY_MS: u32 = 500;
pub const MQTT_CHECK_DELAY_MS: u32 = 500;

// scheduler watchdog and housekeeping
pub const WATCHDOG_MAX_SETUP_MILLIS: u64 = 5;
pub const WATCHDOG_MAX_LOOP_MILLIS: u64 = 5;
pub const WATCHDOG_SLOW_LOOP_TIME: u64 = 50;
pub const SETTINGS_CHECK_INTERVAL_MS: u64 = 500;
pub const STATS_INTERVAL_MS: u64 = 60_000;

/// Parses the build-time broker port, falling back to the standard one.
pub fn default_mqtt_port() -> u16 {
    option_env!("MQTT_PORT")
        .unwrap_or("-")
        .parse()
        .unwrap_or(DEFAULT_MQTT_PORT)
}

/// How many polls fit into a timeout given in seconds.
pub fn max_attempts(timeout_secs: u16, poll_ms: u32) -> u32 {
    if poll_ms == 0 {
        return 0;
    }
    (u32::from(timeout_secs) * 1000) / poll_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_follow_timeout() {
        assert_eq!(max_attempts(10, 500), 20);
        assert_eq!(max_attempts(0, 500), 0);
        assert_eq!(max_attempts(1, 300), 3);
        assert_eq!(max_attempts(5, 0), 0);
    }
}

// EOF
