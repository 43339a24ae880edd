// lib.rs

pub use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

mod config;
pub use config::*;

mod settings;
pub use settings::*;

mod store;
pub use store::*;

mod platform;
pub use platform::*;

mod module;
pub use module::*;

mod wifi;
pub use wifi::*;

mod mqtt;
pub use mqtt::*;

mod app;
pub use app::*;

#[cfg(any(test, feature = "mock"))]
mod mock;
#[cfg(any(test, feature = "mock"))]
pub use mock::*;

#[cfg(target_os = "espidf")]
pub mod esp;

pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");

// EOF
