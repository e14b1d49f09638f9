use phyter_link::domain::settings::SettingsService;
use phyter_link::infrastructure::bluetooth::simulator::{SimulatedAdapter, SimulatedInstrument};
use phyter_link::infrastructure::logging;
use phyter_link::InstrumentService;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings_service = SettingsService::new()?;

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting pHyter link demo");
    info!("Settings loaded from {}", settings_service.path().display());

    // No radio stack is wired in; drive a simulated instrument instead
    let adapter = Arc::new(SimulatedAdapter::new());
    adapter.set_part_delay(Duration::from_millis(200));
    adapter.add_instrument(
        SimulatedInstrument::new("C4:64:E3:5A:10:2B", Some("pHyter 42".into())).with_rssi(-52),
    );

    let service = InstrumentService::from_settings(adapter, settings_service.get())?;
    if !service.is_enabled() {
        anyhow::bail!("Bluetooth adapter unavailable");
    }

    let mut scan = service.scan()?;
    let sighting = match scan.next().await {
        Some(Ok(sighting)) => sighting,
        Some(Err(e)) => return Err(e.into()),
        None => anyhow::bail!("No instrument found"),
    };
    drop(scan);
    info!("Found {} ({}) at {} dBm", sighting.name, sighting.address, sighting.rssi);

    let instrument = service.select(&sighting);
    instrument.connect().await?;
    if let Err(e) = settings_service.remember_instrument(instrument.address()) {
        error!("Failed to save settings: {}", e);
    }

    let salinity = instrument
        .set_salinity(settings_service.get().default_salinity)
        .await?;
    info!("Salinity confirmed: {}", salinity);

    instrument.background().await?;
    let measurement = instrument.measure().await?;
    println!("{}", serde_json::to_string_pretty(&measurement)?);

    service.release();
    info!("Done");
    Ok(())
}
