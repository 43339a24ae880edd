// platform.rs

// Hardware seam. The esp module implements these on top of ESP-IDF,
// the mock module in memory for tests.

use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;

/// A fixed-size byte region that survives power cycles.
pub trait SettingsStorage {
    fn capacity(&self) -> usize;
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> anyhow::Result<()>;
    fn write(&mut self, offset: usize, data: &[u8]) -> anyhow::Result<()>;
    /// Makes previous writes durable.
    fn commit(&mut self) -> anyhow::Result<()>;
}

pub trait SystemControl {
    /// Reboots the device. On hardware this does not return.
    fn restart(&mut self);
    fn uptime_ms(&self) -> u64;
    fn free_heap(&self) -> u32;
}

/// Station status as reported by the radio, with the numeric codes
/// diagnostics tools expect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StationStatus {
    Idle,
    NoSsidAvail,
    ScanCompleted,
    Connected,
    ConnectFailed,
    ConnectionLost,
    Disconnected,
}

impl StationStatus {
    pub fn code(self) -> i32 {
        match self {
            StationStatus::Idle => 0,
            StationStatus::NoSsidAvail => 1,
            StationStatus::ScanCompleted => 2,
            StationStatus::Connected => 3,
            StationStatus::ConnectFailed => 4,
            StationStatus::ConnectionLost => 5,
            StationStatus::Disconnected => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StationStatus::Idle => "WL_IDLE_STATUS",
            StationStatus::NoSsidAvail => "WL_NO_SSID_AVAIL",
            StationStatus::ScanCompleted => "WL_SCAN_COMPLETED",
            StationStatus::Connected => "WL_CONNECTED",
            StationStatus::ConnectFailed => "WL_CONNECT_FAILED",
            StationStatus::ConnectionLost => "WL_CONNECTION_LOST",
            StationStatus::Disconnected => "WL_DISCONNECTED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StationInfo {
    pub ssid: String,
    pub bssid: String,
    pub channel: u8,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mask: u8,
    pub dns1: Option<Ipv4Addr>,
    pub dns2: Option<Ipv4Addr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccessPointInfo {
    pub ssid: String,
    pub ip: Ipv4Addr,
    pub mac: String,
}

pub trait WifiRadio {
    fn set_hostname(&mut self, hostname: &str) -> anyhow::Result<()>;
    /// Starts a station-mode association and returns without waiting.
    fn begin_station(&mut self, ssid: &str, password: &str) -> anyhow::Result<()>;
    fn station_status(&self) -> StationStatus;
    fn reconnect(&mut self) -> anyhow::Result<()>;
    fn start_access_point(&mut self, ssid: &str, password: &str) -> anyhow::Result<()>;
    fn stop_access_point(&mut self) -> anyhow::Result<()>;
    fn rssi(&self) -> Option<i8>;
    fn mac_address(&self) -> String;
    fn station_info(&self) -> Option<StationInfo>;
    fn ap_info(&self) -> Option<AccessPointInfo>;
}

/// Connection state of the broker client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    ConnectionTimeout,
    ConnectionLost,
    ConnectFailed,
    Disconnected,
    Connected,
    BadProtocol,
    BadClientId,
    Unavailable,
    BadCredentials,
    Unauthorized,
}

impl ClientState {
    pub fn code(self) -> i32 {
        match self {
            ClientState::ConnectionTimeout => -4,
            ClientState::ConnectionLost => -3,
            ClientState::ConnectFailed => -2,
            ClientState::Disconnected => -1,
            ClientState::Connected => 0,
            ClientState::BadProtocol => 1,
            ClientState::BadClientId => 2,
            ClientState::Unavailable => 3,
            ClientState::BadCredentials => 4,
            ClientState::Unauthorized => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClientState::ConnectionTimeout => "MQTT_CONNECTION_TIMEOUT",
            ClientState::ConnectionLost => "MQTT_CONNECTION_LOST",
            ClientState::ConnectFailed => "MQTT_CONNECT_FAILED",
            ClientState::Disconnected => "MQTT_DISCONNECTED",
            ClientState::Connected => "MQTT_CONNECTED",
            ClientState::BadProtocol => "MQTT_CONNECT_BAD_PROTOCOL",
            ClientState::BadClientId => "MQTT_CONNECT_BAD_CLIENT_ID",
            ClientState::Unavailable => "MQTT_CONNECT_UNAVAILABLE",
            ClientState::BadCredentials => "MQTT_CONNECT_BAD_CREDENTIALS",
            ClientState::Unauthorized => "MQTT_CONNECT_UNAUTHORIZED",
        }
    }

    /// Failures that end a connection attempt without waiting for the timeout.
    pub fn is_terminal_failure(self) -> bool {
        !matches!(self, ClientState::Connected | ClientState::Disconnected)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub last_will: Option<LastWill>,
    pub keep_alive_secs: u16,
    pub socket_timeout_secs: u16,
    pub buffer_size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub trait MqttTransport {
    /// Starts connecting; progress is observed through `state()`.
    fn connect(&mut self, options: &ConnectOptions) -> anyhow::Result<()>;
    fn state(&self) -> ClientState;
    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> anyhow::Result<()>;
    fn subscribe(&mut self, topic: &str, qos: QoS) -> anyhow::Result<()>;
    fn unsubscribe(&mut self, topic: &str) -> anyhow::Result<()>;
    fn disconnect(&mut self);
    fn next_message(&mut self) -> Option<InboundMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_failures() {
        assert!(!ClientState::Connected.is_terminal_failure());
        assert!(!ClientState::Disconnected.is_terminal_failure());
        for s in [
            ClientState::BadCredentials,
            ClientState::Unauthorized,
            ClientState::BadClientId,
            ClientState::Unavailable,
            ClientState::BadProtocol,
            ClientState::ConnectFailed,
            ClientState::ConnectionLost,
            ClientState::ConnectionTimeout,
        ] {
            assert!(s.is_terminal_failure(), "{s}");
        }
    }
}

// EOF
