// module.rs

use serde_json::{Map, Value};

use crate::*;

/// Anything the scheduler drives: set up once, then ticked every cycle.
/// `tick()` must return quickly; blocking work belongs in `setup()` or in
/// operator-triggered requests.
pub trait Module {
    fn name(&self) -> &'static str;
    fn version(&self) -> &'static str;

    fn setup(&mut self, settings: &mut SettingsStore);
    fn tick(&mut self, settings: &mut SettingsStore);

    /// Multi-line status for the periodic stats dump.
    fn log_info(&self) -> String {
        format!("|> {} Module, version {}", self.name(), self.version())
    }

    fn json_info(&self) -> Value {
        Value::Object(self.json_header())
    }

    fn json_header(&self) -> Map<String, Value> {
        let mut doc = Map::new();
        doc.insert("name".into(), self.name().into());
        doc.insert("version".into(), self.version().into());
        doc
    }
}

// EOF
