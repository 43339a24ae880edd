// mqtt.rs

use std::collections::HashMap;
use std::fmt::Write as _;

use embedded_hal::delay::DelayNs;
use log::*;
use serde_json::Value;

use crate::*;

pub const MQTT_MODULE_NAME: &str = "MQTT";
pub const MQTT_MODULE_VERSION: &str = "1.0";

const STATUS_TOPIC: &str = "STATUS";
const COMMAND_TOPIC: &str = "COMMAND";

/// Handler for `<root>/COMMAND/<module>/<command>`, called with
/// `(command, payload)`.
pub type CommandHandler = Box<dyn FnMut(&str, &str) + Send>;

#[derive(Debug)]
struct BrokerConfig {
    server: String,
    port: u16,
    username: String,
    password: String,
    topic: String,
    timeout: u16,
    client_id: String,
}

impl BrokerConfig {
    fn from_settings(settings: &SettingsStore) -> Result<Self, SettingsError> {
        Ok(Self {
            server: settings.get(MQTT_MODULE_NAME, "server")?,
            port: settings.get(MQTT_MODULE_NAME, "port")?,
            username: settings.get(MQTT_MODULE_NAME, "username")?,
            password: settings.get(MQTT_MODULE_NAME, "password")?,
            topic: settings.get(MQTT_MODULE_NAME, "topic")?,
            timeout: settings.get(MQTT_MODULE_NAME, "timeout")?,
            client_id: settings.get(WIFI_MODULE_NAME, "hostname")?,
        })
    }

    fn options(&self, status_topic: String) -> ConnectOptions {
        let credential = |s: &str| (!s.is_empty()).then(|| s.to_string());
        ConnectOptions {
            host: self.server.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            username: credential(&self.username),
            password: credential(&self.password),
            last_will: Some(LastWill {
                topic: status_topic,
                payload: "offline".into(),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            keep_alive_secs: MQTT_KEEP_ALIVE_SECS,
            socket_timeout_secs: MQTT_SOCKET_TIMEOUT_SECS,
            buffer_size: MQTT_BUFFER_SIZE,
        }
    }
}

pub struct ChannelController<M, D> {
    client: M,
    delay: D,
    link: LinkFlag,
    connection_desired: bool,
    topic: String,
    callbacks: HashMap<String, CommandHandler>,
    last_message: String,
    server: String,
    port: u16,
}

impl<M: MqttTransport, D: DelayNs> ChannelController<M, D> {
    pub fn new(
        client: M,
        delay: D,
        link: LinkFlag,
        settings: &mut SettingsStore,
    ) -> Result<Self, SettingsError> {
        settings
            .category_mut(MQTT_MODULE_NAME)?
            .add("server", Setting::text(DEFAULT_MQTT_SERVER, 63))
            .add("port", Setting::new(default_mqtt_port()))
            .add("username", Setting::text(DEFAULT_MQTT_USER, 32))
            .add("password", Setting::text(DEFAULT_MQTT_PASS, 32))
            .add("topic", Setting::text(DEFAULT_MQTT_TOPIC, 32))
            .add("timeout", Setting::new(DEFAULT_MQTT_TIMEOUT_SECS));

        Ok(Self {
            client,
            delay,
            link,
            connection_desired: true,
            topic: String::new(),
            callbacks: HashMap::new(),
            last_message: String::new(),
            server: String::new(),
            port: 0,
        })
    }

    pub fn client(&self) -> &M {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut M {
        &mut self.client
    }

    pub fn state(&self) -> ClientState {
        self.client.state()
    }

    pub fn is_connected(&self) -> bool {
        self.client.state() == ClientState::Connected
    }

    pub fn connection_desired(&self) -> bool {
        self.connection_desired
    }

    /// Session topic, `<root topic>/<client name>`.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn last_message(&self) -> &str {
        &self.last_message
    }

    pub fn connect(&mut self, settings: &SettingsStore) -> ClientState {
        self.connection_desired = true;
        self.establish_connection(settings)
    }

    /// Blocks for up to the configured timeout. Only for setup, link
    /// recovery and operator-triggered reconnects.
    pub fn establish_connection(&mut self, settings: &SettingsStore) -> ClientState {
        if !self.link.is_up() || !self.connection_desired {
            return ClientState::Disconnected;
        }
        if self.client.state() == ClientState::Connected {
            return ClientState::Connected;
        }

        let config = match BrokerConfig::from_settings(settings) {
            Ok(c) => c,
            Err(e) => {
                error!("MQTT: {e}");
                self.set_last_message("MQTT settings unavailable");
                return ClientState::Disconnected;
            }
        };
        if config.server.is_empty() {
            self.set_last_message("No MQTT server configured");
            return ClientState::Disconnected;
        }

        self.topic = format!("{}/{}", config.topic, config.client_id);
        self.server = config.server.clone();
        self.port = config.port;
        let status_topic = format!("{}/{STATUS_TOPIC}", self.topic);

        info!(
            "MQTT connecting to {}:{} as {}",
            config.server, config.port, config.client_id
        );
        if let Err(e) = self.client.connect(&config.options(status_topic)) {
            self.set_last_message(&format!("MQTT connect failed: {e:#}"));
            return ClientState::ConnectFailed;
        }

        let max_loops = max_attempts(config.timeout, MQTT_CHECK_DELAY_MS);
        let mut loops = 0;
        let mut state = self.client.state();
        while state != ClientState::Connected && loops < max_loops {
            if state.is_terminal_failure() {
                break;
            }
            self.delay.delay_ms(MQTT_CHECK_DELAY_MS);
            loops += 1;
            state = self.client.state();
        }

        if state != ClientState::Connected {
            if state == ClientState::Disconnected {
                state = ClientState::ConnectionTimeout;
            }
            self.client.disconnect();
            self.set_last_message(&format!("MQTT connect failed: {state}"));
            return state;
        }

        self.set_last_message("MQTT connected");
        if let Err(e) = self.publish_with(STATUS_TOPIC, "online", true) {
            warn!("MQTT: cannot announce online status: {e:#}");
        }
        if let Err(e) = self.subscribe(&format!("{COMMAND_TOPIC}/#"), QoS::AtLeastOnce) {
            warn!("MQTT: cannot subscribe to commands: {e:#}");
        }
        ClientState::Connected
    }

    /// Operator-initiated teardown. A graceful shutdown publishes "offline"
    /// first.
    pub fn disconnect(&mut self) {
        self.connection_desired = false;
        self.client.disconnect();
        self.set_last_message("MQTT disconnected");
    }

    pub fn on_link_event(&mut self, event: &LinkEvent, settings: &SettingsStore) {
        if event.is_link_up() {
            info!("MQTT: network is up, reconnecting");
            self.establish_connection(settings);
        } else if event.is_link_down() {
            info!("MQTT: network is down");
        }
    }

    pub fn publish_to(
        &mut self,
        root: &str,
        topic: &str,
        payload: &str,
        retained: bool,
    ) -> anyhow::Result<()> {
        let full = format!("{root}/{topic}");
        debug!("MQTT publish {full}: {payload}");
        self.client.publish(&full, payload.as_bytes(), retained)
    }

    pub fn publish_with(
        &mut self,
        topic: &str,
        payload: &str,
        retained: bool,
    ) -> anyhow::Result<()> {
        let root = self.topic.clone();
        self.publish_to(&root, topic, payload, retained)
    }

    pub fn publish(&mut self, topic: &str, payload: &str) -> anyhow::Result<()> {
        self.publish_with(topic, payload, false)
    }

    pub fn subscribe_to(&mut self, root: &str, topic: &str, qos: QoS) -> anyhow::Result<()> {
        let full = format!("{root}/{topic}");
        info!("MQTT subscribe {full} (QoS {})", qos.level());
        self.client.subscribe(&full, qos)
    }

    pub fn subscribe(&mut self, topic: &str, qos: QoS) -> anyhow::Result<()> {
        let root = self.topic.clone();
        self.subscribe_to(&root, topic, qos)
    }

    pub fn unsubscribe_from(&mut self, root: &str, topic: &str) -> anyhow::Result<()> {
        let full = format!("{root}/{topic}");
        info!("MQTT unsubscribe {full}");
        self.client.unsubscribe(&full)
    }

    pub fn unsubscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        let root = self.topic.clone();
        self.unsubscribe_from(&root, topic)
    }

    /// One handler per module name, the last registration wins.
    pub fn register_callback<F>(&mut self, module: &str, handler: F)
    where
        F: FnMut(&str, &str) + Send + 'static,
    {
        if self
            .callbacks
            .insert(module.to_string(), Box::new(handler))
            .is_some()
        {
            info!("MQTT: replaced callback for {module}");
        }
    }

    /// Routes `<root>/COMMAND/<module>/<command>` to the module's handler.
    /// Returns whether a handler ran.
    pub fn handle_message(&mut self, topic: &str, payload: &str) -> bool {
        let prefix = format!("{}/{COMMAND_TOPIC}/", self.topic);
        let path = match topic.strip_prefix(&prefix) {
            Some(p) if !p.is_empty() => p,
            _ => {
                warn!("MQTT: ignoring message on {topic}");
                return false;
            }
        };

        let (module, command) = path.split_once('/').unwrap_or(("system", path));
        info!("MQTT command {module}/{command}: {payload}");
        match self.callbacks.get_mut(module) {
            Some(handler) => {
                handler(command, payload);
                true
            }
            None => {
                info!("MQTT: no callback registered for {module}");
                false
            }
        }
    }

    fn set_last_message(&mut self, msg: &str) {
        info!("{msg}");
        self.last_message = msg.to_string();
    }
}

impl<M: MqttTransport, D: DelayNs> Module for ChannelController<M, D> {
    fn name(&self) -> &'static str {
        MQTT_MODULE_NAME
    }

    fn version(&self) -> &'static str {
        MQTT_MODULE_VERSION
    }

    fn setup(&mut self, settings: &mut SettingsStore) {
        self.connect(settings);
    }

    fn tick(&mut self, _settings: &mut SettingsStore) {
        while let Some(msg) = self.client.next_message() {
            let payload = String::from_utf8_lossy(&msg.payload).into_owned();
            self.handle_message(&msg.topic, &payload);
        }
    }

    fn log_info(&self) -> String {
        let state = self.client.state();
        let mut s = format!("|> {} Module, version {}\n", self.name(), self.version());
        let _ = writeln!(s, "|>  - Status: {} ({})", state.code(), state.as_str());
        let _ = writeln!(s, "|>  - Last: {}", self.last_message);
        let _ = writeln!(s, "|>  - Server: {}:{}", self.server, self.port);
        let _ = writeln!(s, "|>  - Topic: {}", self.topic);
        let _ = writeln!(s, "|>  - Buffer: {MQTT_BUFFER_SIZE}");
        s
    }

    fn json_info(&self) -> Value {
        let state = self.client.state();
        let mut doc = self.json_header();
        doc.insert("status".into(), state.as_str().into());
        doc.insert("state".into(), state.code().into());
        doc.insert("connected".into(), (state == ClientState::Connected).into());
        doc.insert("connectionDesired".into(), self.connection_desired.into());
        doc.insert("lastMessage".into(), self.last_message.clone().into());
        doc.insert("server".into(), self.server.clone().into());
        doc.insert("port".into(), self.port.into());
        doc.insert("topic".into(), self.topic.clone().into());
        doc.insert("bufferSize".into(), MQTT_BUFFER_SIZE.into());
        Value::Object(doc)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    use crate::ClientState::*;

    fn setup(
        script: &[ClientState],
        link_up: bool,
    ) -> (ChannelController<MockMqtt, MockDelay>, SettingsStore) {
        let mut settings = SettingsStore::new(MemStorage::new(SETTINGS_REGION_SIZE));
        settings
            .category_mut(WIFI_MODULE_NAME)
            .unwrap()
            .add("hostname", Setting::text("fan1", 15));
        let flag = LinkFlag::new();
        flag.set(link_up);
        let mut chan =
            ChannelController::new(MockMqtt::new(script), MockDelay::default(), flag, &mut settings)
                .unwrap();
        settings.load_all();
        settings
            .set(MQTT_MODULE_NAME, "server", "broker.lan".to_string())
            .unwrap();
        settings
            .set(MQTT_MODULE_NAME, "topic", "airflow".to_string())
            .unwrap();
        chan.topic = "airflow/fan1".into();
        (chan, settings)
    }

    fn recorder() -> (Arc<Mutex<Vec<(String, String)>>>, impl FnMut(&str, &str) + Send) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |cmd: &str, payload: &str| {
            sink.lock().unwrap().push((cmd.to_string(), payload.to_string()))
        })
    }

    #[test]
    fn link_down_means_no_broker_traffic() {
        let (mut chan, settings) = setup(&[Connected], false);
        assert_eq!(chan.connect(&settings), Disconnected);
        assert!(chan.client().connects.is_empty());
        assert!(chan.connection_desired());
    }

    #[test]
    fn not_desired_means_no_broker_traffic() {
        let (mut chan, settings) = setup(&[Connected], true);
        chan.disconnect();
        assert_eq!(chan.establish_connection(&settings), Disconnected);
        assert!(chan.client().connects.is_empty());
    }

    #[test]
    fn connect_announces_and_subscribes() {
        let (mut chan, settings) = setup(&[Disconnected, Connected], true);
        assert_eq!(chan.connect(&settings), Connected);
        assert_eq!(chan.topic(), "airflow/fan1");

        let opts = &chan.client().connects[0];
        assert_eq!(opts.host, "broker.lan");
        assert_eq!(opts.port, default_mqtt_port());
        assert_eq!(opts.client_id, "fan1");
        assert_eq!(opts.buffer_size, 1280);
        let will = opts.last_will.as_ref().unwrap();
        assert_eq!(will.topic, "airflow/fan1/STATUS");
        assert_eq!(will.payload, "offline");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);

        assert_eq!(
            chan.client().published,
            vec![("airflow/fan1/STATUS".to_string(), "online".to_string(), true)]
        );
        assert_eq!(
            chan.client().subscribed,
            vec![("airflow/fan1/COMMAND/#".to_string(), QoS::AtLeastOnce)]
        );
        assert_eq!(chan.delay.calls, 1);
    }

    #[test]
    fn already_connected_is_a_no_op() {
        let (mut chan, settings) = setup(&[Connected], true);
        chan.connect(&settings);
        assert_eq!(chan.connect(&settings), Connected);
        assert_eq!(chan.client().connects.len(), 1);
    }

    #[test]
    fn terminal_failure_aborts_early() {
        let (mut chan, settings) = setup(&[Disconnected, BadCredentials], true);
        assert_eq!(chan.connect(&settings), BadCredentials);
        assert_eq!(chan.delay.calls, 1);
        assert!(chan.last_message().contains("MQTT_CONNECT_BAD_CREDENTIALS"));
        assert!(chan.client().published.is_empty());
    }

    #[test]
    fn timeout_is_bounded() {
        let (mut chan, mut settings) = setup(&[Disconnected], true);
        settings.set(MQTT_MODULE_NAME, "timeout", 2u16).unwrap();
        assert_eq!(chan.connect(&settings), ConnectionTimeout);
        assert_eq!(chan.delay.calls, 4);
        assert_eq!(chan.client().disconnects, 1);
    }

    #[test]
    fn empty_server_is_not_attempted() {
        let (mut chan, mut settings) = setup(&[Connected], true);
        settings.set(MQTT_MODULE_NAME, "server", String::new()).unwrap();
        assert_eq!(chan.connect(&settings), Disconnected);
        assert!(chan.client().connects.is_empty());
        assert_eq!(chan.last_message(), "No MQTT server configured");
    }

    #[test]
    fn link_up_event_reconnects() {
        let (mut chan, settings) = setup(&[Connected], false);
        chan.connect(&settings);
        assert!(chan.client().connects.is_empty());

        chan.link.set(true);
        chan.on_link_event(&LinkEvent::LostIp, &settings);
        assert!(chan.client().connects.is_empty());
        chan.on_link_event(&LinkEvent::GotIp6, &settings);
        assert_eq!(chan.client().connects.len(), 1);
        assert!(chan.is_connected());
    }

    #[test]
    fn publish_uses_session_root() {
        let (mut chan, settings) = setup(&[Connected], true);
        chan.connect(&settings);
        chan.publish("fan/speed", "42").unwrap();
        chan.publish_to("other", "x", "1", true).unwrap();
        chan.publish_with("fan/mode", "auto", true).unwrap();
        chan.unsubscribe("COMMAND/#").unwrap();

        let published = &chan.client().published;
        assert_eq!(
            published[1],
            ("airflow/fan1/fan/speed".to_string(), "42".to_string(), false)
        );
        assert_eq!(published[2], ("other/x".to_string(), "1".to_string(), true));
        assert_eq!(
            published[3],
            ("airflow/fan1/fan/mode".to_string(), "auto".to_string(), true)
        );
        assert_eq!(chan.client().unsubscribed, vec!["airflow/fan1/COMMAND/#"]);
    }

    #[test]
    fn routes_to_module_and_system() {
        let (mut chan, _settings) = setup(&[Connected], true);
        let (fan, fan_cb) = recorder();
        let (system, system_cb) = recorder();
        chan.register_callback("fan", fan_cb);
        chan.register_callback("system", system_cb);

        assert!(chan.handle_message("airflow/fan1/COMMAND/fan/setSpeed", "42"));
        assert!(chan.handle_message("airflow/fan1/COMMAND/reboot", ""));

        assert_eq!(*fan.lock().unwrap(), vec![("setSpeed".to_string(), "42".to_string())]);
        assert_eq!(*system.lock().unwrap(), vec![("reboot".to_string(), String::new())]);
    }

    #[test]
    fn unregistered_module_is_dropped() {
        let (mut chan, _settings) = setup(&[Connected], true);
        let (fan, fan_cb) = recorder();
        let (system, system_cb) = recorder();
        chan.register_callback("fan", fan_cb);
        chan.register_callback("system", system_cb);

        assert!(!chan.handle_message("airflow/fan1/COMMAND/light/on", "1"));
        assert!(!chan.handle_message("airflow/fan1/COMMAND/", "1"));
        assert!(!chan.handle_message("someone/else/COMMAND/fan/x", "1"));
        assert!(fan.lock().unwrap().is_empty());
        assert!(system.lock().unwrap().is_empty());
    }

    #[test]
    fn last_registration_wins() {
        let (mut chan, _settings) = setup(&[Connected], true);
        let (first, first_cb) = recorder();
        let (second, second_cb) = recorder();
        chan.register_callback("fan", first_cb);
        chan.register_callback("fan", second_cb);

        chan.handle_message("airflow/fan1/COMMAND/fan/stop", "");
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn tick_drains_inbox() {
        let (mut chan, mut settings) = setup(&[Connected], true);
        let (fan, fan_cb) = recorder();
        chan.register_callback("fan", fan_cb);
        chan.connect(&settings);

        chan.client_mut().deliver("airflow/fan1/COMMAND/fan/setSpeed", "10");
        chan.client_mut().deliver("airflow/fan1/COMMAND/fan/setSpeed", "20");
        chan.tick(&mut settings);

        assert_eq!(fan.lock().unwrap().len(), 2);
        assert!(chan.client().inbox.is_empty());
    }

    #[test]
    fn status_snapshot() {
        let (mut chan, settings) = setup(&[Connected], true);
        chan.connect(&settings);
        let doc = chan.json_info();
        assert_eq!(doc["name"], "MQTT");
        assert_eq!(doc["status"], "MQTT_CONNECTED");
        assert_eq!(doc["bufferSize"], 1280);
        assert!(chan.log_info().contains("|>  - Topic: airflow/fan1"));
    }
}

// EOF
