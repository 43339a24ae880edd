// wifi.rs

use std::fmt::Write as _;
use std::net::Ipv4Addr;

use embedded_hal::delay::DelayNs;
use log::*;
use serde_json::{json, Value};

use crate::*;

pub const WIFI_MODULE_NAME: &str = "WiFi";
pub const WIFI_MODULE_VERSION: &str = "1.0";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkMode {
    Off,
    Station,
    AccessPoint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Driver events. They are raised on the driver's own task and handed to
/// the controllers from the control loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    WifiReady,
    ScanDone,
    StationStart,
    StationStop,
    StationConnected { ssid: String },
    StationDisconnected,
    GotIp { ip: Ipv4Addr },
    GotIp6,
    LostIp,
    RssiLow,
    ApStart,
    ApStop,
    ApStationConnected,
    ApStationDisconnected,
    ApStationIpAssigned,
    ApProbeRequest,
}

impl LinkEvent {
    pub fn is_link_up(&self) -> bool {
        matches!(self, LinkEvent::GotIp { .. } | LinkEvent::GotIp6)
    }

    pub fn is_link_down(&self) -> bool {
        matches!(self, LinkEvent::StationDisconnected | LinkEvent::LostIp)
    }
}

/// Shared view of "station link is connected", written by the link
/// controller and read by whoever needs the network.
#[derive(Clone, Debug, Default)]
pub struct LinkFlag(Arc<AtomicBool>);

impl LinkFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, up: bool) {
        self.0.store(up, Ordering::Release);
    }
}

/// RSSI in dBm to a 0..100 quality percentage.
// by https://github.com/tzapu/WiFiManager/blob/master/WiFiManager.cpp
pub fn signal_quality(rssi: i32) -> u8 {
    if rssi <= -100 {
        0
    } else if rssi >= -50 {
        100
    } else {
        (2 * (rssi + 100)) as u8
    }
}

fn mask_to_addr(bits: u8) -> Ipv4Addr {
    let bits = u32::from(bits.min(32));
    Ipv4Addr::from(u32::MAX.checked_shl(32 - bits).unwrap_or(0))
}

pub struct LinkController<R, D> {
    radio: R,
    delay: D,
    status: LinkStatus,
    mode: LinkMode,
    last_message: String,
    hostname: String,
    flag: LinkFlag,
    ap_enabled: bool,
}

impl<R: WifiRadio, D: DelayNs> LinkController<R, D> {
    pub fn new(
        radio: R,
        delay: D,
        flag: LinkFlag,
        settings: &mut SettingsStore,
    ) -> Result<Self, SettingsError> {
        settings
            .category_mut(WIFI_MODULE_NAME)?
            .add("hostname", Setting::text(DEFAULT_DEVICE_NAME, 15))
            .add("ssid", Setting::text(DEFAULT_WIFI_SSID, 32))
            .add("password", Setting::text(DEFAULT_WIFI_PASS, 63))
            .add("timeout", Setting::new(DEFAULT_WIFI_TIMEOUT_SECS));

        Ok(Self {
            radio,
            delay,
            status: LinkStatus::Disconnected,
            mode: LinkMode::Off,
            last_message: String::new(),
            hostname: DEFAULT_DEVICE_NAME.to_string(),
            flag,
            ap_enabled: cfg!(feature = "ap_mode"),
        })
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn is_connected(&self) -> bool {
        self.status == LinkStatus::Connected
    }

    pub fn last_message(&self) -> &str {
        &self.last_message
    }

    pub fn flag(&self) -> LinkFlag {
        self.flag.clone()
    }

    /// Station connect, falling back to the access point.
    pub fn start(&mut self, settings: &SettingsStore) -> LinkStatus {
        if self.connect(settings) != LinkStatus::Connected {
            self.start_access_point();
        }
        self.status
    }

    /// Blocks for up to the configured timeout. Only for setup and
    /// operator-triggered recovery.
    pub fn connect(&mut self, settings: &SettingsStore) -> LinkStatus {
        if self.mode == LinkMode::AccessPoint {
            if let Err(e) = self.radio.stop_access_point() {
                warn!("WiFi: cannot stop access point: {e:#}");
            }
        }
        self.mode = LinkMode::Station;

        let (ssid, password, timeout) = match Self::credentials(settings) {
            Ok(c) => c,
            Err(e) => {
                error!("WiFi: {e}");
                self.set_last_message("WiFi settings unavailable");
                self.set_status(LinkStatus::Failed);
                return self.status;
            }
        };

        if ssid.is_empty() {
            self.set_last_message("No WiFi SSID configured");
            self.set_status(LinkStatus::Failed);
            return self.status;
        }

        info!("Connecting to WiFi - SSID: {ssid}");
        info!("MAC: {mac}", mac = self.radio.mac_address());

        self.set_status(LinkStatus::Connecting);
        if let Err(e) = self.radio.begin_station(&ssid, &password) {
            self.set_last_message(&format!("WiFi connect failed: {e:#}"));
            self.set_status(LinkStatus::Failed);
            return self.status;
        }

        let max_loops = max_attempts(timeout, WIFI_CHECK_DELAY_MS);
        let mut loops = 0;
        let mut station = self.radio.station_status();
        let mut no_ssid = false;
        while station != StationStatus::Connected && loops < max_loops {
            if station == StationStatus::NoSsidAvail {
                no_ssid = true;
                break;
            }
            self.delay.delay_ms(WIFI_CHECK_DELAY_MS);
            loops += 1;
            station = self.radio.station_status();
        }

        if station == StationStatus::Connected {
            self.set_status(LinkStatus::Connected);
            info!("WiFi connected successfully");
        } else {
            self.set_status(LinkStatus::Failed);
            if no_ssid {
                self.set_last_message("WiFi SSID not available");
            } else {
                self.set_last_message(&format!(
                    "WiFi connect failed: {code} ({s})",
                    code = station.code(),
                    s = station.as_str()
                ));
            }
        }
        self.status
    }

    fn credentials(settings: &SettingsStore) -> Result<(String, String, u16), SettingsError> {
        Ok((
            settings.get::<String>(WIFI_MODULE_NAME, "ssid")?,
            settings.get::<String>(WIFI_MODULE_NAME, "password")?,
            settings.get::<u16>(WIFI_MODULE_NAME, "timeout")?,
        ))
    }

    pub fn reconnect(&mut self) {
        info!("WiFi reconnecting...");
        if let Err(e) = self.radio.reconnect() {
            self.set_last_message(&format!("WiFi reconnect failed: {e:#}"));
        }
    }

    /// Returns whether the access point is up.
    pub fn start_access_point(&mut self) -> bool {
        if !self.ap_enabled {
            self.set_status(LinkStatus::Failed);
            self.set_last_message("WiFi AP mode not enabled. Reboot to try again.");
            return false;
        }

        info!("Starting Access Point");
        if self.radio.ap_info().is_some() {
            if let Err(e) = self.radio.stop_access_point() {
                warn!("WiFi: cannot stop previous access point: {e:#}");
            }
        }
        self.mode = LinkMode::AccessPoint;

        match self.radio.start_access_point(AP_SSID, AP_PASS) {
            Ok(()) => {
                self.set_last_message(&format!("WiFi AP started: {AP_SSID}"));
                true
            }
            Err(e) => {
                self.set_status(LinkStatus::Failed);
                self.set_last_message(&format!("WiFi AP failed: {e:#}"));
                false
            }
        }
    }

    /// Applies a driver event. Never blocks.
    pub fn on_event(&mut self, event: &LinkEvent) {
        match event {
            LinkEvent::WifiReady => {
                self.set_status(LinkStatus::Disconnected);
                self.set_last_message("WiFi Ready");
            }
            LinkEvent::ScanDone => self.set_last_message("WiFi Scan Done"),
            LinkEvent::StationStart => {
                self.set_status(LinkStatus::Connecting);
                self.mode = LinkMode::Station;
                self.set_last_message("WiFi Station Start");
            }
            LinkEvent::StationStop => {
                self.set_status(LinkStatus::Disconnected);
                self.mode = LinkMode::Off;
                self.set_last_message("WiFi Station Stop");
            }
            LinkEvent::StationConnected { ssid } => {
                self.set_status(LinkStatus::Connected);
                self.set_last_message(&format!("WiFi Connected to SSID: {ssid}"));
                if let Some(rssi) = self.radio.rssi() {
                    let rssi = i32::from(rssi);
                    info!("WiFi strength: {q}% ({rssi} dBm)", q = signal_quality(rssi));
                }
            }
            LinkEvent::StationDisconnected => {
                self.set_status(LinkStatus::Disconnected);
                self.set_last_message("WiFi Disconnected");
            }
            LinkEvent::GotIp { ip } => {
                self.set_status(LinkStatus::Connected);
                self.set_last_message(&format!("IP: {ip}"));
            }
            LinkEvent::GotIp6 => self.set_last_message("WiFi Got IP6"),
            LinkEvent::LostIp => {
                self.set_status(LinkStatus::Connecting);
                self.set_last_message("WiFi Lost IP");
            }
            LinkEvent::RssiLow => {
                self.set_last_message("WiFi BSS RSSI Low");
                if let Some(rssi) = self.radio.rssi() {
                    let rssi = i32::from(rssi);
                    info!("WiFi strength: {rssi} dBm {q}%", q = signal_quality(rssi));
                }
            }
            LinkEvent::ApStart => {
                self.mode = LinkMode::AccessPoint;
                self.set_last_message("WiFi AP Start");
            }
            LinkEvent::ApStop => {
                self.mode = LinkMode::Off;
                self.set_last_message("WiFi AP Stop");
            }
            LinkEvent::ApStationConnected => self.set_last_message("WiFi AP Station Connected"),
            LinkEvent::ApStationDisconnected => {
                self.set_last_message("WiFi AP Station Disconnected")
            }
            LinkEvent::ApStationIpAssigned => {
                self.set_last_message("WiFi AP Station IP Assigned")
            }
            LinkEvent::ApProbeRequest => self.set_last_message("WiFi AP Probe Request Received"),
        }
    }

    pub fn friendly_mode(&self) -> (i32, &'static str) {
        match self.mode {
            LinkMode::Off => (0, "NULL"),
            LinkMode::Station => (1, "STA"),
            LinkMode::AccessPoint => (2, "AP"),
        }
    }

    pub fn friendly_status(&self) -> (i32, &'static str) {
        let s = self.radio.station_status();
        (s.code(), s.as_str())
    }

    fn set_status(&mut self, status: LinkStatus) {
        self.status = status;
        self.flag.set(status == LinkStatus::Connected);
    }

    fn set_last_message(&mut self, msg: &str) {
        info!("WIFI: {msg}");
        self.last_message = msg.to_string();
    }
}

impl<R: WifiRadio, D: DelayNs> Module for LinkController<R, D> {
    fn name(&self) -> &'static str {
        WIFI_MODULE_NAME
    }

    fn version(&self) -> &'static str {
        WIFI_MODULE_VERSION
    }

    fn setup(&mut self, settings: &mut SettingsStore) {
        match settings.get::<String>(WIFI_MODULE_NAME, "hostname") {
            Ok(h) => self.hostname = h,
            Err(e) => error!("WiFi: {e}"),
        }
        if let Err(e) = self.radio.set_hostname(&self.hostname) {
            warn!("WiFi: cannot set hostname: {e:#}");
        }
        self.start(settings);
    }

    fn tick(&mut self, _settings: &mut SettingsStore) {
        // nothing to poll, state changes arrive as events
    }

    fn log_info(&self) -> String {
        let mut s = format!("|> {} Module, version {}\n", self.name(), self.version());
        let (mode_id, mode) = self.friendly_mode();
        let (status_id, status) = self.friendly_status();
        let _ = writeln!(s, "|>  - Mode: {mode_id} ({mode})");
        let _ = writeln!(s, "|>  - Status: {status_id} ({status})");
        let _ = writeln!(s, "|>  - Last: {}", self.last_message);

        match self.mode {
            LinkMode::Off => {
                let _ = writeln!(s, "|>  - WiFi is OFF");
            }
            LinkMode::Station => {
                if let Some(rssi) = self.radio.rssi() {
                    let rssi = i32::from(rssi);
                    let _ = writeln!(s, "|>  - Signal: {rssi} dBm {}%", signal_quality(rssi));
                }
                let _ = writeln!(s, "|>  - MAC: {}", self.radio.mac_address());
                let _ = writeln!(s, "|>  - Hostname: {}", self.hostname);
                if let Some(info) = self.radio.station_info() {
                    let _ = writeln!(s, "|>  - IP: {}", info.ip);
                    let _ = writeln!(s, "|>  - Channel: {}", info.channel);
                    let _ = writeln!(s, "|>  - SSID: {}", info.ssid);
                    let _ = writeln!(s, "|>  - BSSID: {}", info.bssid);
                    let _ = writeln!(s, "|>  - Gateway: {}", info.gateway);
                    let _ = writeln!(s, "|>  - Subnet: {}", mask_to_addr(info.mask));
                    if let Some(dns) = info.dns1 {
                        let _ = writeln!(s, "|>  - DNS1: {dns}");
                    }
                    if let Some(dns) = info.dns2 {
                        let _ = writeln!(s, "|>  - DNS2: {dns}");
                    }
                }
            }
            LinkMode::AccessPoint => {
                if let Some(ap) = self.radio.ap_info() {
                    let _ = writeln!(s, "|>  - SoftAP IP: {}", ap.ip);
                    let _ = writeln!(s, "|>  - SoftAP MAC: {}", ap.mac);
                    let _ = writeln!(s, "|>  - SoftAP SSID: {}", ap.ssid);
                }
            }
        }
        s
    }

    fn json_info(&self) -> Value {
        let mut doc = self.json_header();
        doc.insert("mode".into(), self.friendly_mode().1.into());
        doc.insert("status".into(), self.friendly_status().1.into());
        doc.insert("lastMessage".into(), self.last_message.clone().into());

        match self.mode {
            LinkMode::Off => {
                doc.insert("state".into(), "OFF".into());
            }
            LinkMode::Station => {
                doc.insert("state".into(), "STATION".into());
                if let Some(rssi) = self.radio.rssi() {
                    let rssi = i32::from(rssi);
                    doc.insert(
                        "signal".into(),
                        json!({ "rssi": rssi, "quality": signal_quality(rssi) }),
                    );
                }
                doc.insert("mac".into(), self.radio.mac_address().into());
                doc.insert("hostname".into(), self.hostname.clone().into());
                if let Some(info) = self.radio.station_info() {
                    doc.insert("subnet".into(), mask_to_addr(info.mask).to_string().into());
                    if let Ok(Value::Object(fields)) = serde_json::to_value(&info) {
                        doc.extend(fields);
                    }
                }
            }
            LinkMode::AccessPoint => {
                doc.insert("state".into(), "ACCESS_POINT".into());
                if let Some(ap) = self.radio.ap_info() {
                    doc.insert("softap".into(), json!(ap));
                }
            }
        }
        Value::Object(doc)
    }
}


// EOF
