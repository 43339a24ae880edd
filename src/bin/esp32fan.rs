// bin/esp32fan.rs

#[cfg(target_os = "espidf")]
esp_idf_sys::esp_app_desc!();

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    firmware::run()
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!(
        "{} {} is ESP32 firmware, build it for an ESP-IDF target.",
        env!("CARGO_BIN_NAME"),
        esp32fan::FW_VERSION
    );
    std::process::exit(1);
}

#[cfg(target_os = "espidf")]
mod firmware {
    use std::{sync::mpsc, time::Instant};

    use anyhow::Context;
    use esp32fan::{esp::*, *};
    use esp_idf_hal::{delay::FreeRtos, prelude::Peripherals};
    use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs, wifi::EspWifi};
    use log::*;

    pub fn run() -> anyhow::Result<()> {
        esp_idf_sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();

        info!("Hello.");
        info!(
            "{} {FW_VERSION} built {}",
            env!("CARGO_BIN_NAME"),
            env!("BUILD_TIMESTAMP")
        );

        let sysloop = EspSystemEventLoop::take()?;
        let nvs_default_partition = nvs::EspDefaultNvsPartition::take()?;

        let ns = env!("CARGO_BIN_NAME");
        let nvs = nvs::EspNvs::new(nvs_default_partition.clone(), ns, true)
            .with_context(|| format!("Could not get namespace {ns}"))?;
        info!("Got namespace {ns:?} from default partition");

        #[cfg(feature = "reset_settings")]
        let nvs = {
            let mut nvs = nvs;
            warn!("Erasing stored settings");
            nvs.remove(SETTINGS_KEY)?;
            nvs
        };

        let storage = NvsStorage::new(nvs, SETTINGS_REGION_SIZE);

        let peripherals = Peripherals::take()?;
        let wifi = EspWifi::new(
            peripherals.modem,
            sysloop.clone(),
            Some(nvs_default_partition),
        )?;

        let (events_tx, events_rx) = mpsc::channel();
        let radio = EspRadio::new(wifi, &sysloop, events_tx)?;

        let mut app = App::new(
            storage,
            radio,
            EspMqttTransport::new(),
            FreeRtos,
            EspSystem,
            events_rx,
        )?;
        app.setup();

        let boot = Instant::now();
        info!("Entering main loop...");
        loop {
            app.run_cycle(boot.elapsed().as_millis() as u64);
            // let the idle task run
            FreeRtos::delay_ms(1);
        }
    }
}

// EOF
