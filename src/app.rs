// app.rs

use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Instant;

use embedded_hal::delay::DelayNs;
use log::*;
use serde_json::{Map, Value};

use crate::*;

pub const SYSTEM_MODULE: &str = "system";
pub const SETTINGS_MODULE: &str = "settings";

/// Work the command handlers hand back to the control loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppRequest {
    Restart,
    FactoryReset,
    Save,
    Status,
    Reconnect,
    WifiReconnect,
    SetSetting {
        category: String,
        name: String,
        value: String,
    },
}

impl AppRequest {
    pub fn from_system_command(command: &str) -> Option<Self> {
        match command {
            "restart" => Some(AppRequest::Restart),
            "factoryReset" => Some(AppRequest::FactoryReset),
            "save" => Some(AppRequest::Save),
            "status" => Some(AppRequest::Status),
            "reconnect" => Some(AppRequest::Reconnect),
            "wifiReconnect" => Some(AppRequest::WifiReconnect),
            _ => None,
        }
    }

    /// `command` is `<category>/<key>`.
    pub fn from_settings_command(command: &str, payload: &str) -> Option<Self> {
        let (category, name) = command.split_once('/')?;
        if category.is_empty() || name.is_empty() {
            return None;
        }
        Some(AppRequest::SetSetting {
            category: category.to_string(),
            name: name.to_string(),
            value: payload.to_string(),
        })
    }
}

#[derive(Debug, Default)]
struct LoopStats {
    count: u64,
    total_ms: u64,
    max_ms: u64,
    window_start_ms: u64,
}

/// The application context: owns the store, both controllers and any
/// further modules, and drives them from one control loop.
pub struct App<R, M, D> {
    pub settings: SettingsStore,
    pub link: LinkController<R, D>,
    pub channel: ChannelController<M, D>,
    modules: Vec<Box<dyn Module>>,
    system: Box<dyn SystemControl>,
    events: Receiver<LinkEvent>,
    requests: Receiver<AppRequest>,
    restart_requested: bool,
    factory_reset_requested: bool,
    last_settings_check: u64,
    last_stats: u64,
    stats: LoopStats,
}

impl<R, M, D> App<R, M, D>
where
    R: WifiRadio,
    M: MqttTransport,
    D: DelayNs + Clone,
{
    pub fn new(
        storage: impl SettingsStorage + 'static,
        radio: R,
        client: M,
        delay: D,
        system: impl SystemControl + 'static,
        events: Receiver<LinkEvent>,
    ) -> Result<Self, SettingsError> {
        let mut settings = SettingsStore::new(storage);
        let flag = LinkFlag::new();
        let link = LinkController::new(radio, delay.clone(), flag.clone(), &mut settings)?;
        let mut channel = ChannelController::new(client, delay, flag, &mut settings)?;

        let (tx, requests) = mpsc::channel();
        channel.register_callback(SYSTEM_MODULE, system_handler(tx.clone()));
        channel.register_callback(SETTINGS_MODULE, settings_handler(tx));

        Ok(Self {
            settings,
            link,
            channel,
            modules: Vec::new(),
            system: Box::new(system),
            events,
            requests,
            restart_requested: false,
            factory_reset_requested: false,
            last_settings_check: 0,
            last_stats: 0,
            stats: LoopStats::default(),
        })
    }

    /// Extra modules must register their settings before `setup()`.
    pub fn add_module(&mut self, module: Box<dyn Module>) {
        info!("Adding module {} {}", module.name(), module.version());
        self.modules.push(module);
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_requested || self.factory_reset_requested
    }

    pub fn request(&mut self, request: AppRequest) {
        self.handle_request(request);
    }

    pub fn setup(&mut self) {
        info!("Starting up, firmware {FW_VERSION}");
        self.settings.load_all();

        self.for_each_module(|module, settings| {
            let start = Instant::now();
            module.setup(settings);
            let elapsed = start.elapsed().as_millis() as u64;
            if elapsed > WATCHDOG_MAX_SETUP_MILLIS {
                info!("Module {} took {elapsed} ms to set up", module.name());
            }
        });
        self.drain_events();
        info!("Setup done");
    }

    /// One pass of the control loop.
    pub fn run_cycle(&mut self, now_ms: u64) {
        let start = Instant::now();

        self.drain_events();
        self.for_each_module(|module, settings| {
            let t = Instant::now();
            module.tick(settings);
            let elapsed = t.elapsed().as_millis() as u64;
            if elapsed > WATCHDOG_MAX_LOOP_MILLIS {
                info!("Module {} tick took {elapsed} ms", module.name());
            }
        });
        while let Ok(request) = self.requests.try_recv() {
            self.handle_request(request);
        }

        if now_ms.saturating_sub(self.last_settings_check) > SETTINGS_CHECK_INTERVAL_MS {
            self.last_settings_check = now_ms;
            if self.settings.is_dirty() {
                info!("Settings are dirty, saving");
                self.save_settings();
            }
        }

        let elapsed = start.elapsed().as_millis() as u64;
        self.stats.count += 1;
        self.stats.total_ms += elapsed;
        self.stats.max_ms = self.stats.max_ms.max(elapsed);
        if elapsed > WATCHDOG_SLOW_LOOP_TIME {
            info!("Slow loop: {elapsed} ms");
        }

        if now_ms.saturating_sub(self.last_stats) > STATS_INTERVAL_MS {
            self.dump_stats(now_ms);
            self.last_stats = now_ms;
        }

        self.handle_pending_restart();
    }

    fn for_each_module(&mut self, mut f: impl FnMut(&mut dyn Module, &mut SettingsStore)) {
        f(&mut self.link, &mut self.settings);
        f(&mut self.channel, &mut self.settings);
        for module in self.modules.iter_mut() {
            f(module.as_mut(), &mut self.settings);
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            debug!("Link event: {event:?}");
            self.link.on_event(&event);
            self.channel.on_link_event(&event, &self.settings);
        }
    }

    fn handle_request(&mut self, request: AppRequest) {
        info!("Request: {request:?}");
        match request {
            AppRequest::Restart => self.restart_requested = true,
            AppRequest::FactoryReset => self.factory_reset_requested = true,
            AppRequest::Save => self.save_settings(),
            AppRequest::Status => self.publish_status(),
            AppRequest::Reconnect => {
                self.channel.connect(&self.settings);
            }
            AppRequest::WifiReconnect => self.link.reconnect(),
            AppRequest::SetSetting {
                category,
                name,
                value,
            } => self.apply_setting(&category, &name, &value),
        }
    }

    fn apply_setting(&mut self, category: &str, name: &str, raw: &str) {
        let kind = match self.settings.setting(category, name) {
            Some(s) => s.kind(),
            None => {
                warn!("Settings: {category}.{name} not found");
                return;
            }
        };
        let result = SettingValue::parse_as(kind, raw)
            .and_then(|v| self.settings.set_value_checked(category, name, v));
        match result {
            Ok(()) => info!("Settings: {category}.{name} set"),
            Err(e) => warn!("Settings: {e}"),
        }
    }

    fn save_settings(&mut self) {
        match self.settings.save_all() {
            Ok(true) => info!("Settings saved"),
            Ok(false) => debug!("Settings unchanged"),
            Err(e) => error!("Settings save failed: {e}"),
        }
    }

    pub fn status_document(&self) -> Value {
        let mut doc = Map::new();
        doc.insert(self.link.name().into(), self.link.json_info());
        doc.insert(self.channel.name().into(), self.channel.json_info());
        for module in self.modules.iter() {
            doc.insert(module.name().into(), module.json_info());
        }
        doc.insert("uptime".into(), self.system.uptime_ms().into());
        doc.insert("freeHeap".into(), self.system.free_heap().into());
        Value::Object(doc)
    }

    fn publish_status(&mut self) {
        let doc = self.status_document().to_string();
        if let Err(e) = self.channel.publish("STATUS/INFO", &doc) {
            warn!("Cannot publish status: {e:#}");
        }
    }

    fn dump_stats(&mut self, now_ms: u64) {
        let window_ms = now_ms.saturating_sub(self.stats.window_start_ms).max(1);
        let avg = if self.stats.count > 0 {
            self.stats.total_ms as f32 / self.stats.count as f32
        } else {
            0.0
        };
        info!("|> Uptime: {} s", now_ms / 1000);
        info!("|> Free heap: {} bytes", self.system.free_heap());
        info!(
            "|> Loops: {} ({:.1}/s), avg {avg:.2} ms, max {} ms",
            self.stats.count,
            self.stats.count as f32 * 1000.0 / window_ms as f32,
            self.stats.max_ms
        );
        info!("{}", self.link.log_info().trim_end());
        info!("{}", self.channel.log_info().trim_end());
        for module in self.modules.iter() {
            info!("{}", module.log_info().trim_end());
        }
        self.stats = LoopStats {
            window_start_ms: now_ms,
            ..Default::default()
        };
    }

    /// Restart and factory reset wait until pending settings are persisted
    /// by the periodic check. A factory reset goes ahead when the settings
    /// can no longer be stored at all.
    fn handle_pending_restart(&mut self) {
        if !self.restart_pending() {
            return;
        }
        if self.settings.is_dirty() {
            if self.factory_reset_requested && !self.settings.fits() {
                warn!("Settings cannot be stored, discarding them");
            } else {
                debug!("Restart deferred, settings not saved yet");
                return;
            }
        }

        if let Err(e) = self.channel.publish_with("STATUS", "offline", true) {
            debug!("Cannot announce offline: {e:#}");
        }
        self.channel.disconnect();

        if self.factory_reset_requested {
            warn!("Factory reset");
            self.factory_reset_requested = false;
            self.restart_requested = false;
            self.settings.factory_reset(self.system.as_mut());
        } else {
            warn!("Restarting");
            self.restart_requested = false;
            self.system.restart();
        }
    }
}

fn system_handler(tx: Sender<AppRequest>) -> impl FnMut(&str, &str) + Send + 'static {
    move |command: &str, _payload: &str| match AppRequest::from_system_command(command) {
        Some(request) => {
            if tx.send(request).is_err() {
                error!("System command {command} dropped");
            }
        }
        None => warn!("Unknown system command: {command}"),
    }
}

fn settings_handler(tx: Sender<AppRequest>) -> impl FnMut(&str, &str) + Send + 'static {
    move |command: &str, payload: &str| match AppRequest::from_settings_command(command, payload)
    {
        Some(request) => {
            if tx.send(request).is_err() {
                error!("Settings command {command} dropped");
            }
        }
        None => warn!("Bad settings command: {command}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        app: App<MockRadio, MockMqtt, MockDelay>,
        storage: MemStorage,
        events: Sender<LinkEvent>,
    }

    fn fixture(storage: MemStorage) -> Fixture {
        let (events, rx) = mpsc::channel();
        let mut app = App::new(
            storage.clone(),
            MockRadio::new(&[StationStatus::Connected]),
            MockMqtt::new(&[ClientState::Connected]),
            MockDelay::default(),
            MockSystem::default(),
            rx,
        )
        .unwrap();
        app.settings
            .set(WIFI_MODULE_NAME, "ssid", "homenet".to_string())
            .unwrap();
        app.settings
            .set(MQTT_MODULE_NAME, "server", "broker.lan".to_string())
            .unwrap();
        Fixture {
            app,
            storage,
            events,
        }
    }

    fn online(storage: MemStorage) -> Fixture {
        let mut f = fixture(storage);
        f.app.setup();
        f.events
            .send(LinkEvent::GotIp {
                ip: std::net::Ipv4Addr::new(192, 168, 1, 50),
            })
            .unwrap();
        f.app.run_cycle(1);
        f
    }

    fn root(f: &Fixture) -> String {
        format!("{}/COMMAND", f.app.channel.topic())
    }

    #[test]
    fn system_commands_parse() {
        assert_eq!(
            AppRequest::from_system_command("factoryReset"),
            Some(AppRequest::FactoryReset)
        );
        assert_eq!(AppRequest::from_system_command("reboot"), None);
        assert_eq!(
            AppRequest::from_settings_command("MQTT/port", "1884"),
            Some(AppRequest::SetSetting {
                category: "MQTT".into(),
                name: "port".into(),
                value: "1884".into(),
            })
        );
        assert_eq!(AppRequest::from_settings_command("MQTT", "1"), None);
        assert_eq!(AppRequest::from_settings_command("/port", "1"), None);
    }

    #[test]
    fn setup_connects_everything() {
        let f = online(MemStorage::new(SETTINGS_REGION_SIZE));
        assert!(f.app.link.is_connected());
        assert!(f.app.channel.is_connected());
        assert_eq!(f.app.channel.topic(), format!("{DEFAULT_MQTT_TOPIC}/{DEFAULT_DEVICE_NAME}"));
    }

    #[test]
    fn settings_command_saves_on_next_check() {
        let storage = MemStorage::new(SETTINGS_REGION_SIZE);
        let mut f = online(storage.clone());
        let topic = format!("{}/settings/MQTT/port", root(&f));
        f.app.channel.client_mut().deliver(&topic, " 1884 ");
        f.app.run_cycle(100);
        assert_eq!(f.app.settings.get::<u16>(MQTT_MODULE_NAME, "port"), Ok(1884));
        assert!(f.app.settings.is_dirty());

        f.app.run_cycle(700);
        assert!(!f.app.settings.is_dirty());

        let mut reloaded = fixture(storage.clone());
        reloaded.app.settings.load_all();
        assert_eq!(
            reloaded.app.settings.get::<u16>(MQTT_MODULE_NAME, "port"),
            Ok(1884)
        );
    }

    #[test]
    fn bad_setting_value_is_ignored() {
        let mut f = online(MemStorage::new(SETTINGS_REGION_SIZE));
        let topic = format!("{}/settings/MQTT/port", root(&f));
        f.app.channel.client_mut().deliver(&topic, "lots");
        let topic = format!("{}/settings/Nope/port", root(&f));
        f.app.channel.client_mut().deliver(&topic, "1");
        f.app.run_cycle(100);
        assert_eq!(
            f.app.settings.get::<u16>(MQTT_MODULE_NAME, "port"),
            Ok(default_mqtt_port())
        );
    }

    #[test]
    fn status_is_published() {
        let mut f = online(MemStorage::new(SETTINGS_REGION_SIZE));
        let topic = format!("{}/status", root(&f));
        f.app.channel.client_mut().deliver(&topic, "");
        f.app.run_cycle(100);

        let (t, payload, retained) = f.app.channel.client().published.last().unwrap().clone();
        assert_eq!(t, format!("{}/STATUS/INFO", f.app.channel.topic()));
        assert!(!retained);
        let doc: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(doc["WiFi"]["name"], "WiFi");
        assert_eq!(doc["MQTT"]["status"], "MQTT_CONNECTED");
    }

    #[test]
    fn restart_waits_for_clean_store() {
        let storage = MemStorage::new(SETTINGS_REGION_SIZE);
        let mut f = online(storage.clone());
        f.app
            .settings
            .set(MQTT_MODULE_NAME, "topic", "vent".to_string())
            .unwrap();
        storage.set_fail_commit(true);

        let topic = format!("{}/restart", root(&f));
        f.app.channel.client_mut().deliver(&topic, "");
        f.app.run_cycle(100);
        assert!(f.app.restart_pending());
        assert!(f.app.settings.is_dirty());

        storage.set_fail_commit(false);
        f.app.run_cycle(700);
        assert!(!f.app.restart_pending());
        assert!(!f.app.settings.is_dirty());
        assert!(!f.app.channel.connection_desired());

        let published = &f.app.channel.client().published;
        let (t, payload, retained) = published.last().unwrap();
        assert!(t.ends_with("/STATUS"));
        assert_eq!(payload, "offline");
        assert!(*retained);
    }

    #[test]
    fn factory_reset_restores_defaults() {
        let storage = MemStorage::new(SETTINGS_REGION_SIZE);
        let mut f = online(storage.clone());
        f.app.settings.set(WIFI_MODULE_NAME, "timeout", 30u16).unwrap();
        f.app.request(AppRequest::Save);
        f.app.request(AppRequest::FactoryReset);
        f.app.run_cycle(100);
        assert!(!f.app.restart_pending());

        storage.power_cycle();
        let mut rebooted = fixture(storage);
        rebooted.app.settings.load_all();
        assert_eq!(
            rebooted.app.settings.get::<u16>(WIFI_MODULE_NAME, "timeout"),
            Ok(DEFAULT_WIFI_TIMEOUT_SECS)
        );
    }

    #[test]
    fn pending_restart_retries_save_on_interval() {
        let storage = MemStorage::new(SETTINGS_REGION_SIZE);
        let mut f = online(storage.clone());
        storage.set_fail_commit(true);
        f.app.request(AppRequest::Restart);
        for now in (100..=500).step_by(50) {
            f.app.run_cycle(now);
        }
        assert_eq!(storage.writes(), 0);

        f.app.run_cycle(600);
        f.app.run_cycle(650);
        f.app.run_cycle(700);
        assert_eq!(storage.writes(), 1);
        assert!(f.app.restart_pending());

        f.app.run_cycle(1200);
        assert_eq!(storage.writes(), 2);
    }

    #[test]
    fn value_too_wide_to_store_is_rejected() {
        let storage = MemStorage::new(SETTINGS_REGION_SIZE);
        let mut f = online(storage.clone());
        f.app.request(AppRequest::Save);
        f.app.run_cycle(10);
        assert!(!f.app.settings.is_dirty());

        let topic = format!("{}/settings/WiFi/password", root(&f));
        f.app
            .channel
            .client_mut()
            .deliver(&topic, &"\u{1}".repeat(63));
        f.app.run_cycle(100);
        assert_eq!(
            f.app.settings.get::<String>(WIFI_MODULE_NAME, "password"),
            Ok(DEFAULT_WIFI_PASS.to_string())
        );
        assert!(!f.app.settings.is_dirty());
        assert!(f.app.settings.fits());
    }

    #[test]
    fn factory_reset_ignores_unsaveable_settings() {
        let storage = MemStorage::new(SETTINGS_REGION_SIZE);
        let mut f = online(storage.clone());
        f.app.request(AppRequest::Save);
        f.app.run_cycle(10);
        assert_eq!(storage.committed()[0], SETTINGS_HEADER_BYTE);

        f.app
            .settings
            .set(WIFI_MODULE_NAME, "password", "\u{1}".repeat(63))
            .unwrap();
        assert!(!f.app.settings.fits());
        f.app.request(AppRequest::FactoryReset);
        f.app.run_cycle(100);
        assert!(!f.app.restart_pending());
        assert_eq!(storage.committed()[0], 0);

        let (t, payload, retained) = f.app.channel.client().published.last().unwrap().clone();
        assert!(t.ends_with("/STATUS"));
        assert_eq!(payload, "offline");
        assert!(retained);
    }

    #[test]
    fn broker_drop_is_recovered_by_reconnect() {
        let mut f = online(MemStorage::new(SETTINGS_REGION_SIZE));
        f.app.channel.client().set_state(ClientState::ConnectionLost);
        f.app.run_cycle(100);
        assert!(!f.app.channel.is_connected());
        assert_eq!(f.app.channel.client().connects.len(), 1);

        f.app.request(AppRequest::Reconnect);
        f.app.run_cycle(200);
        let client = f.app.channel.client();
        assert_eq!(client.connects.len(), 2);
        assert_eq!(client.subscribed.len(), 2);
        let onlines = client
            .published
            .iter()
            .filter(|(t, p, retained)| t.ends_with("/STATUS") && p == "online" && *retained)
            .count();
        assert_eq!(onlines, 2);
    }

    #[test]
    fn link_loss_and_recovery() {
        let mut f = online(MemStorage::new(SETTINGS_REGION_SIZE));
        f.app.channel.client().set_state(ClientState::ConnectionLost);
        f.events.send(LinkEvent::LostIp).unwrap();
        f.app.run_cycle(100);
        assert!(!f.app.link.flag().is_up());
        assert_eq!(f.app.channel.client().connects.len(), 1);

        f.events
            .send(LinkEvent::GotIp {
                ip: std::net::Ipv4Addr::new(192, 168, 1, 51),
            })
            .unwrap();
        f.app.run_cycle(200);
        assert!(f.app.link.flag().is_up());
        assert_eq!(f.app.channel.client().connects.len(), 2);
        assert!(f.app.channel.is_connected());
    }

    #[test]
    fn custom_modules_are_driven() {
        struct Counter {
            ticks: std::sync::Arc<std::sync::atomic::AtomicU32>,
        }
        impl Module for Counter {
            fn name(&self) -> &'static str {
                "Counter"
            }
            fn version(&self) -> &'static str {
                "0.1"
            }
            fn setup(&mut self, _settings: &mut SettingsStore) {}
            fn tick(&mut self, _settings: &mut SettingsStore) {
                self.ticks.fetch_add(1, Ordering::Relaxed);
            }
        }

        let ticks = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut f = fixture(MemStorage::new(SETTINGS_REGION_SIZE));
        f.app.add_module(Box::new(Counter {
            ticks: ticks.clone(),
        }));
        f.app.setup();
        f.app.run_cycle(1);
        f.app.run_cycle(2);
        assert_eq!(ticks.load(Ordering::Relaxed), 2);
        assert_eq!(f.app.status_document()["Counter"]["version"], "0.1");
    }
}

// EOF
