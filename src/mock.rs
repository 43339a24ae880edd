// mock.rs

// In-memory platform for host tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::rc::Rc;

use anyhow::bail;
use embedded_hal::delay::DelayNs;

use crate::*;

#[derive(Debug)]
struct MemRegion {
    data: Vec<u8>,
    committed: Vec<u8>,
    commits: u32,
    writes: u32,
    fail_commit: bool,
}

/// A byte region that can be told to fail its commits. Clones share the
/// same region, so a test can keep a handle while the store owns another.
#[derive(Clone, Debug)]
pub struct MemStorage(Rc<RefCell<MemRegion>>);

impl MemStorage {
    pub fn new(size: usize) -> Self {
        Self(Rc::new(RefCell::new(MemRegion {
            data: vec![0xFF; size],
            committed: vec![0xFF; size],
            commits: 0,
            writes: 0,
            fail_commit: false,
        })))
    }

    pub fn commits(&self) -> u32 {
        self.0.borrow().commits
    }

    pub fn writes(&self) -> u32 {
        self.0.borrow().writes
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.0.borrow_mut().fail_commit = fail;
    }

    /// What would survive a power cut right now.
    pub fn committed(&self) -> Vec<u8> {
        self.0.borrow().committed.clone()
    }

    pub fn poke(&self, offset: usize, data: &[u8]) {
        let mut region = self.0.borrow_mut();
        region.data[offset..offset + data.len()].copy_from_slice(data);
        let end = offset + data.len();
        region.committed[offset..end].copy_from_slice(data);
    }

    /// Simulates a reboot: uncommitted writes are lost.
    pub fn power_cycle(&self) {
        let mut region = self.0.borrow_mut();
        let committed = region.committed.clone();
        region.data = committed;
    }
}

impl SettingsStorage for MemStorage {
    fn capacity(&self) -> usize {
        self.0.borrow().data.len()
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> anyhow::Result<()> {
        let region = self.0.borrow();
        let end = offset + buf.len();
        if end > region.data.len() {
            bail!("read past end: {end} > {}", region.data.len());
        }
        buf.copy_from_slice(&region.data[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> anyhow::Result<()> {
        let mut region = self.0.borrow_mut();
        let end = offset + data.len();
        if end > region.data.len() {
            bail!("write past end: {end} > {}", region.data.len());
        }
        region.data[offset..end].copy_from_slice(data);
        region.writes += 1;
        Ok(())
    }

    fn commit(&mut self) -> anyhow::Result<()> {
        let mut region = self.0.borrow_mut();
        if region.fail_commit {
            bail!("commit failed");
        }
        region.committed = region.data.clone();
        region.commits += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockSystem {
    pub restarts: u32,
    pub now_ms: u64,
}

impl SystemControl for MockSystem {
    fn restart(&mut self) {
        self.restarts += 1;
    }

    fn uptime_ms(&self) -> u64 {
        self.now_ms
    }

    fn free_heap(&self) -> u32 {
        123_456
    }
}

/// Counts requested delay instead of sleeping.
#[derive(Clone, Debug, Default)]
pub struct MockDelay {
    pub total_ms: u64,
    pub calls: u32,
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ms += u64::from(ns / 1_000_000);
        self.calls += 1;
    }

    fn delay_ms(&mut self, ms: u32) {
        self.total_ms += u64::from(ms);
        self.calls += 1;
    }
}

/// Radio whose station status follows a script, one entry per poll.
/// The last entry repeats.
#[derive(Debug)]
pub struct MockRadio {
    pub script: RefCell<VecDeque<StationStatus>>,
    pub polls: Cell<u32>,
    pub hostname: String,
    pub begun: Vec<(String, String)>,
    pub reconnects: u32,
    pub ap_started: u32,
    pub ap_stopped: u32,
    pub ap_running: bool,
    pub rssi: Option<i8>,
    last: Cell<StationStatus>,
}

impl MockRadio {
    pub fn new(script: &[StationStatus]) -> Self {
        Self {
            script: RefCell::new(script.iter().copied().collect()),
            polls: Cell::new(0),
            hostname: String::new(),
            begun: Vec::new(),
            reconnects: 0,
            ap_started: 0,
            ap_stopped: 0,
            ap_running: false,
            rssi: Some(-60),
            last: Cell::new(StationStatus::Idle),
        }
    }
}

impl WifiRadio for MockRadio {
    fn set_hostname(&mut self, hostname: &str) -> anyhow::Result<()> {
        self.hostname = hostname.to_string();
        Ok(())
    }

    fn begin_station(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        self.begun.push((ssid.to_string(), password.to_string()));
        Ok(())
    }

    fn station_status(&self) -> StationStatus {
        self.polls.set(self.polls.get() + 1);
        let mut script = self.script.borrow_mut();
        if script.len() > 1 {
            if let Some(s) = script.pop_front() {
                self.last.set(s);
            }
        } else if let Some(s) = script.front() {
            self.last.set(*s);
        }
        self.last.get()
    }

    fn reconnect(&mut self) -> anyhow::Result<()> {
        self.reconnects += 1;
        Ok(())
    }

    fn start_access_point(&mut self, _ssid: &str, _password: &str) -> anyhow::Result<()> {
        self.ap_started += 1;
        self.ap_running = true;
        Ok(())
    }

    fn stop_access_point(&mut self) -> anyhow::Result<()> {
        self.ap_stopped += 1;
        self.ap_running = false;
        Ok(())
    }

    fn rssi(&self) -> Option<i8> {
        self.rssi
    }

    fn mac_address(&self) -> String {
        "24:0A:C4:00:00:01".into()
    }

    fn station_info(&self) -> Option<StationInfo> {
        (self.last.get() == StationStatus::Connected).then(|| StationInfo {
            ssid: self.begun.last().map(|b| b.0.clone()).unwrap_or_default(),
            bssid: "AA:BB:CC:DD:EE:FF".into(),
            channel: 6,
            ip: Ipv4Addr::new(192, 168, 1, 50),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            mask: 24,
            dns1: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dns2: None,
        })
    }

    fn ap_info(&self) -> Option<AccessPointInfo> {
        self.ap_running.then(|| AccessPointInfo {
            ssid: AP_SSID.into(),
            ip: Ipv4Addr::from(AP_ADDRESS),
            mac: "24:0A:C4:00:00:02".into(),
        })
    }
}

/// Broker client with a scripted connection state and a record of
/// everything sent.
#[derive(Debug)]
pub struct MockMqtt {
    pub script: RefCell<VecDeque<ClientState>>,
    pub connects: Vec<ConnectOptions>,
    pub published: Vec<(String, String, bool)>,
    pub subscribed: Vec<(String, QoS)>,
    pub unsubscribed: Vec<String>,
    pub disconnects: u32,
    pub inbox: VecDeque<InboundMessage>,
    /// State reported before any connect() call.
    pub idle_state: ClientState,
    state: Cell<ClientState>,
    connecting: Cell<bool>,
}

impl MockMqtt {
    /// `script` is consumed one entry per `state()` poll after `connect()`.
    pub fn new(script: &[ClientState]) -> Self {
        Self {
            script: RefCell::new(script.iter().copied().collect()),
            connects: Vec::new(),
            published: Vec::new(),
            subscribed: Vec::new(),
            unsubscribed: Vec::new(),
            disconnects: 0,
            inbox: VecDeque::new(),
            idle_state: ClientState::Disconnected,
            state: Cell::new(ClientState::Disconnected),
            connecting: Cell::new(false),
        }
    }

    pub fn deliver(&mut self, topic: &str, payload: &str) {
        self.inbox.push_back(InboundMessage {
            topic: topic.into(),
            payload: payload.as_bytes().to_vec(),
        });
    }

    /// Forces the state, e.g. to simulate a dropped connection.
    pub fn set_state(&self, state: ClientState) {
        self.state.set(state);
        self.connecting.set(false);
    }
}

impl MqttTransport for MockMqtt {
    fn connect(&mut self, options: &ConnectOptions) -> anyhow::Result<()> {
        self.connects.push(options.clone());
        self.connecting.set(true);
        Ok(())
    }

    fn state(&self) -> ClientState {
        if !self.connecting.get() {
            if self.connects.is_empty() {
                return self.idle_state;
            }
            return self.state.get();
        }
        let mut script = self.script.borrow_mut();
        if script.len() > 1 {
            if let Some(s) = script.pop_front() {
                self.state.set(s);
            }
        } else if let Some(s) = script.front() {
            self.state.set(*s);
        }
        self.state.get()
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> anyhow::Result<()> {
        if self.state.get() != ClientState::Connected {
            bail!("not connected");
        }
        self.published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
            retained,
        ));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> anyhow::Result<()> {
        self.subscribed.push((topic.to_string(), qos));
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        self.unsubscribed.push(topic.to_string());
        Ok(())
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
        self.set_state(ClientState::Disconnected);
    }

    fn next_message(&mut self) -> Option<InboundMessage> {
        if self.state.get() != ClientState::Connected {
            return None;
        }
        self.inbox.pop_front()
    }
}

// EOF
