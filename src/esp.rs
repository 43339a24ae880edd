// esp.rs

// ESP-IDF implementations of the platform traits.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{mpsc::Sender, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail};
use embedded_svc::wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    ipv4,
    mqtt::client::{self as esp_mqtt, EspMqttClient, EventPayload, LwtConfiguration, MqttClientConfiguration},
    netif::{self, EspNetif},
    nvs,
    wifi::{EspWifi, WifiEvent},
};
use log::*;

use crate::*;

pub const SETTINGS_KEY: &str = "settings";

/// The settings region, mirrored in RAM and written to one NVS blob on
/// commit.
pub struct NvsStorage {
    nvs: nvs::EspNvs<nvs::NvsDefault>,
    buf: Vec<u8>,
}

impl NvsStorage {
    pub fn new(mut nvs: nvs::EspNvs<nvs::NvsDefault>, size: usize) -> Self {
        let mut buf = vec![0xFF; size];
        info!("Reading up to {size} bytes from nvs...");
        match nvs.get_raw(SETTINGS_KEY, &mut buf) {
            Ok(Some(b)) => info!("Got {sz} bytes from nvs.", sz = b.len()),
            Ok(None) => info!("Nvs key not found"),
            Err(e) => error!("Nvs read error {e:?}"),
        }
        Self { nvs, buf }
    }
}

impl SettingsStorage for NvsStorage {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> anyhow::Result<()> {
        let src = self
            .buf
            .get(offset..offset + buf.len())
            .ok_or_else(|| anyhow!("read past end of settings region"))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> anyhow::Result<()> {
        let dst = self
            .buf
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| anyhow!("write past end of settings region"))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> anyhow::Result<()> {
        match self.nvs.set_raw(SETTINGS_KEY, &self.buf) {
            Ok(_) => Ok(()),
            Err(e) => bail!("Cannot save to nvs: {e:?}"),
        }
    }
}

pub struct EspSystem;

impl SystemControl for EspSystem {
    fn restart(&mut self) {
        esp_idf_hal::reset::restart();
    }

    fn uptime_ms(&self) -> u64 {
        let us = unsafe { esp_idf_sys::esp_timer_get_time() };
        (us / 1000) as u64
    }

    fn free_heap(&self) -> u32 {
        unsafe { esp_idf_sys::esp_get_free_heap_size() }
    }
}

fn mac_string(mac: [u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5],
    )
}

fn ap_record() -> Option<esp_idf_sys::wifi_ap_record_t> {
    let mut rec = esp_idf_sys::wifi_ap_record_t::default();
    let err = unsafe { esp_idf_sys::esp_wifi_sta_get_ap_info(&mut rec) };
    (err == esp_idf_sys::ESP_OK).then_some(rec)
}

/// Station/AP radio. Driver events are forwarded to the control loop
/// through `events`.
pub struct EspRadio {
    wifi: EspWifi<'static>,
    ap_running: bool,
    ssid: Arc<Mutex<String>>,
    _wifi_sub: EspSubscription<'static, System>,
    _ip_sub: EspSubscription<'static, System>,
}

impl EspRadio {
    pub fn new(
        mut wifi: EspWifi<'static>,
        sysloop: &EspSystemEventLoop,
        events: Sender<LinkEvent>,
    ) -> anyhow::Result<Self> {
        let ap_netif = EspNetif::new_with_conf(&netif::NetifConfiguration {
            ip_configuration: ipv4::Configuration::Router(ipv4::RouterConfiguration {
                subnet: ipv4::Subnet {
                    gateway: Ipv4Addr::from(AP_ADDRESS),
                    mask: ipv4::Mask(AP_NETMASK_BITS),
                },
                dhcp_enabled: true,
                dns: None,
                secondary_dns: None,
            }),
            ..netif::NetifConfiguration::wifi_default_router()
        })?;
        wifi.swap_netif_ap(ap_netif)?;

        let ssid = Arc::new(Mutex::new(String::new()));

        let tx = events.clone();
        let sub_ssid = ssid.clone();
        let wifi_sub = sysloop.subscribe::<WifiEvent, _>(move |event| {
            let ev = match event {
                WifiEvent::Ready => LinkEvent::WifiReady,
                WifiEvent::ScanDone(_) => LinkEvent::ScanDone,
                WifiEvent::StaStarted => LinkEvent::StationStart,
                WifiEvent::StaStopped => LinkEvent::StationStop,
                WifiEvent::StaConnected(_) => LinkEvent::StationConnected {
                    ssid: sub_ssid
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone(),
                },
                WifiEvent::StaDisconnected(_) => LinkEvent::StationDisconnected,
                WifiEvent::StaBssRssiLow => LinkEvent::RssiLow,
                WifiEvent::ApStarted => LinkEvent::ApStart,
                WifiEvent::ApStopped => LinkEvent::ApStop,
                WifiEvent::ApStaConnected(_) => LinkEvent::ApStationConnected,
                WifiEvent::ApStaDisconnected(_) => LinkEvent::ApStationDisconnected,
                WifiEvent::ApProbeRequestReceived => LinkEvent::ApProbeRequest,
                _ => return,
            };
            let _ = tx.send(ev);
        })?;

        let ip_sub = sysloop.subscribe::<netif::IpEvent, _>(move |event| {
            let ev = match event {
                netif::IpEvent::DhcpIpAssigned(a) => LinkEvent::GotIp { ip: a.ip() },
                netif::IpEvent::DhcpIp6Assigned(_) => LinkEvent::GotIp6,
                netif::IpEvent::DhcpIpDeassigned(_) => LinkEvent::LostIp,
                netif::IpEvent::ApStaIpAssigned(_) => LinkEvent::ApStationIpAssigned,
                _ => return,
            };
            let _ = events.send(ev);
        })?;

        Ok(Self {
            wifi,
            ap_running: false,
            ssid,
            _wifi_sub: wifi_sub,
            _ip_sub: ip_sub,
        })
    }
}

impl WifiRadio for EspRadio {
    fn set_hostname(&mut self, hostname: &str) -> anyhow::Result<()> {
        self.wifi.sta_netif_mut().set_hostname(hostname)?;
        Ok(())
    }

    fn begin_station(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
            password: password
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;
        *self.ssid.lock().unwrap_or_else(PoisonError::into_inner) = ssid.to_string();

        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        self.wifi.connect()?;
        Ok(())
    }

    fn station_status(&self) -> StationStatus {
        match (self.wifi.is_connected(), self.wifi.sta_netif().is_up()) {
            (Ok(true), Ok(true)) => StationStatus::Connected,
            (Ok(true), _) => StationStatus::Idle,
            _ => StationStatus::Disconnected,
        }
    }

    fn reconnect(&mut self) -> anyhow::Result<()> {
        let _ = self.wifi.disconnect();
        self.wifi.connect()?;
        Ok(())
    }

    fn start_access_point(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        if self.wifi.is_started()? {
            self.wifi.stop()?;
        }
        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid.try_into().map_err(|_| anyhow!("AP ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| anyhow!("AP password too long"))?,
                auth_method: AuthMethod::WPAWPA2Personal,
                channel: 1,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        self.ap_running = true;
        info!("AP started on {ssid}, address {}", Ipv4Addr::from(AP_ADDRESS));
        Ok(())
    }

    fn stop_access_point(&mut self) -> anyhow::Result<()> {
        self.ap_running = false;
        self.wifi.stop()?;
        Ok(())
    }

    fn rssi(&self) -> Option<i8> {
        ap_record().map(|r| r.rssi)
    }

    fn mac_address(&self) -> String {
        self.wifi
            .sta_netif()
            .get_mac()
            .map(mac_string)
            .unwrap_or_default()
    }

    fn station_info(&self) -> Option<StationInfo> {
        let ip = self.wifi.sta_netif().get_ip_info().ok()?;
        let rec = ap_record()?;
        let ssid_len = rec.ssid.iter().position(|&b| b == 0).unwrap_or(rec.ssid.len());
        Some(StationInfo {
            ssid: String::from_utf8_lossy(&rec.ssid[..ssid_len]).into_owned(),
            bssid: mac_string(rec.bssid),
            channel: rec.primary,
            ip: ip.ip,
            gateway: ip.subnet.gateway,
            mask: ip.subnet.mask.0,
            dns1: ip.dns,
            dns2: ip.secondary_dns,
        })
    }

    fn ap_info(&self) -> Option<AccessPointInfo> {
        if !self.ap_running {
            return None;
        }
        let ap = self.wifi.ap_netif();
        Some(AccessPointInfo {
            ssid: AP_SSID.to_string(),
            ip: ap.get_ip_info().ok()?.ip,
            mac: ap.get_mac().map(mac_string).unwrap_or_default(),
        })
    }
}

#[derive(Default)]
struct MqttShared {
    state: Option<ClientState>,
    inbox: VecDeque<InboundMessage>,
}

/// Broker client on top of the IDF MQTT task. Events update shared state
/// that the control loop polls.
pub struct EspMqttTransport {
    client: Option<EspMqttClient<'static>>,
    shared: Arc<Mutex<MqttShared>>,
}

impl EspMqttTransport {
    pub fn new() -> Self {
        Self {
            client: None,
            shared: Default::default(),
        }
    }

    fn client(&mut self) -> anyhow::Result<&mut EspMqttClient<'static>> {
        self.client.as_mut().ok_or_else(|| anyhow!("MQTT client not started"))
    }
}

impl Default for EspMqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn esp_qos(qos: QoS) -> esp_mqtt::QoS {
    match qos {
        QoS::AtMostOnce => esp_mqtt::QoS::AtMostOnce,
        QoS::AtLeastOnce => esp_mqtt::QoS::AtLeastOnce,
        QoS::ExactlyOnce => esp_mqtt::QoS::ExactlyOnce,
    }
}

impl MqttTransport for EspMqttTransport {
    fn connect(&mut self, options: &ConnectOptions) -> anyhow::Result<()> {
        // a new session replaces any old client
        self.client = None;
        {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            shared.state = Some(ClientState::Disconnected);
            shared.inbox.clear();
        }

        let url = format!("mqtt://{}:{}", options.host, options.port);
        let lwt = options.last_will.as_ref().map(|w| LwtConfiguration {
            topic: &w.topic,
            payload: w.payload.as_bytes(),
            qos: esp_qos(w.qos),
            retain: w.retain,
        });
        let conf = MqttClientConfiguration {
            client_id: Some(&options.client_id),
            username: options.username.as_deref(),
            password: options.password.as_deref(),
            lwt,
            keep_alive_interval: Some(Duration::from_secs(options.keep_alive_secs.into())),
            network_timeout: Duration::from_secs(options.socket_timeout_secs.into()),
            buffer_size: options.buffer_size,
            // reconnects go through establish_connection so the session is set up again
            disable_auto_reconnect: true,
            ..Default::default()
        };

        let shared = self.shared.clone();
        let client = EspMqttClient::new_cb(&url, &conf, move |event| {
            let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
            match event.payload() {
                EventPayload::Connected(_) => shared.state = Some(ClientState::Connected),
                EventPayload::Disconnected => {
                    shared.state = Some(ClientState::ConnectionLost);
                }
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    ..
                } => shared.inbox.push_back(InboundMessage {
                    topic: topic.to_string(),
                    payload: data.to_vec(),
                }),
                EventPayload::Error(e) => {
                    warn!("MQTT error: {e:?}");
                    if shared.state != Some(ClientState::Connected) {
                        shared.state = Some(ClientState::ConnectFailed);
                    }
                }
                _ => {}
            }
        })?;
        self.client = Some(client);
        Ok(())
    }

    fn state(&self) -> ClientState {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .unwrap_or(ClientState::Disconnected)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> anyhow::Result<()> {
        // blocks until handed to the socket, "offline" must go out before disconnect
        self.client()?
            .publish(topic, esp_mqtt::QoS::AtLeastOnce, retained, payload)?;
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> anyhow::Result<()> {
        self.client()?.subscribe(topic, esp_qos(qos))?;
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        self.client()?.unsubscribe(topic)?;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.client = None;
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state = Some(ClientState::Disconnected);
    }

    fn next_message(&mut self) -> Option<InboundMessage> {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inbox
            .pop_front()
    }
}

// EOF
