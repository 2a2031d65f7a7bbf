//! Command handlers for the gattkit CLI

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gattkit_btleplug::BtleplugTransport;
use gattkit_core::{
    run_operation, uuids, BleTransport, CentralManager, Peripheral, PeripheralSnapshot, ScanSettings,
    Service,
};

use crate::cli::{Cli, Commands, ValueFormat};
use crate::config::AppConfig;
use crate::device_info::ReadDeviceInformation;
use crate::error::{CliError, Result};
use crate::operations::{encode_value, InspectTree, Listen, ReadValue, WriteValue};
use crate::simulate;

/// How long to wait for the adapter to power on before giving up
const POWER_ON_TIMEOUT: Duration = Duration::from_secs(5);

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher {
    central: CentralManager,
    config: AppConfig,
    simulation: Option<JoinHandle<()>>,
}

impl CommandDispatcher {
    /// Open the transport selected on the command line
    pub async fn new(config: AppConfig, simulate: bool) -> Result<Self> {
        let mut simulation = None;
        let transport: Arc<dyn BleTransport> = if simulate {
            info!("Using simulated peripheral {}", simulate::DEVICE_NAME);
            let mock = simulate::demo_transport();
            simulation = Some(simulate::spawn_activity(mock.clone()));
            Arc::new(mock)
        } else {
            Arc::new(BtleplugTransport::new().await?)
        };

        Ok(Self {
            central: CentralManager::new(transport),
            config,
            simulation,
        })
    }

    /// Execute a CLI command
    pub async fn execute(self, cli: Cli) -> Result<()> {
        if let Commands::Config = cli.command {
            print!("{}", AppConfig::example_config()?);
            return Ok(());
        }

        self.central.wait_until_powered_on(Some(POWER_ON_TIMEOUT)).await?;

        let result = match cli.command {
            Commands::Scan { duration, service } => self.handle_scan(duration, service).await,
            Commands::Inspect { device, service } => self.handle_inspect(device, service).await,
            Commands::Read {
                device,
                characteristic,
                format,
            } => self.handle_read(device, characteristic, format).await,
            Commands::Write {
                device,
                characteristic,
                value,
                format,
                no_response,
            } => {
                self.handle_write(device, characteristic, value, format, !no_response)
                    .await
            }
            Commands::Listen {
                device,
                characteristic,
                count,
                format,
            } => self.handle_listen(device, characteristic, count, format).await,
            Commands::Rssi {
                device,
                samples,
                interval,
            } => self.handle_rssi(device, samples, interval).await,
            Commands::Info { device } => self.handle_info(device).await,
            Commands::Config => Ok(()),
        };

        self.central.shutdown();
        if let Some(activity) = &self.simulation {
            activity.abort();
        }
        result
    }

    // ------------------------------------------------------------------------
    // Device Resolution
    // ------------------------------------------------------------------------

    /// Find `target` by device id or advertised name, scanning if it has not
    /// been seen yet
    async fn find_peripheral(&self, target: &str) -> Result<Peripheral> {
        if let Some(found) = match_target(&self.central.nearby_peripherals(), target) {
            return Ok(self.central.peripheral(found));
        }

        info!("Scanning for {}...", target);
        let mut scan = self.central.start_scan(self.config.scan.settings.clone());
        let deadline = Instant::now() + Duration::from_secs(self.config.scan.resolve_timeout_secs);

        let found = loop {
            tokio::select! {
                snapshot = scan.recv() => match snapshot {
                    Some(nearby) => {
                        if let Some(found) = match_target(&nearby, target) {
                            break Some(found);
                        }
                    }
                    None => break None,
                },
                _ = tokio::time::sleep_until(deadline) => break None,
            }
        };
        self.central.stop_scan();

        found
            .map(|device| self.central.peripheral(device))
            .ok_or_else(|| CliError::DeviceNotFound(target.to_string()))
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    async fn handle_scan(&self, duration: Option<u64>, services: Vec<String>) -> Result<()> {
        let mut settings: ScanSettings = self.config.scan.settings.clone();
        if !services.is_empty() {
            settings = settings.with_services(parse_uuids(&services)?);
        }
        let duration = Duration::from_secs(duration.unwrap_or(self.config.scan.duration_secs));

        info!("Scanning for {:?}...", duration);
        let mut scan = self.central.start_scan(settings);
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        let mut latest = Vec::new();
        loop {
            tokio::select! {
                snapshot = scan.recv() => match snapshot {
                    Some(nearby) => {
                        debug!("{} peripherals nearby", nearby.len());
                        latest = nearby;
                    }
                    None => break,
                },
                _ = &mut deadline => break,
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        self.central.stop_scan();

        print_nearby(&latest);
        Ok(())
    }

    async fn handle_inspect(&self, device: String, services: Vec<String>) -> Result<()> {
        let peripheral = self.find_peripheral(&device).await?;
        let mut configuration = self.config.session.clone();
        if !services.is_empty() {
            configuration = configuration.with_services(parse_uuids(&services)?);
        }

        let tree = run_operation(&peripheral, &mut InspectTree { configuration }).await?;
        println!("{}", peripheral.id());
        print_tree(&tree);
        Ok(())
    }

    async fn handle_read(&self, device: String, characteristic: String, format: ValueFormat) -> Result<()> {
        let characteristic = uuids::parse(&characteristic)?;
        let peripheral = self.find_peripheral(&device).await?;

        let mut operation = ReadValue {
            configuration: self.config.session.clone(),
            characteristic,
            format,
        };
        match run_operation(&peripheral, &mut operation).await? {
            Some(value) => println!("{}", value),
            None => println!("(no value)"),
        }
        Ok(())
    }

    async fn handle_write(
        &self,
        device: String,
        characteristic: String,
        value: String,
        format: ValueFormat,
        with_response: bool,
    ) -> Result<()> {
        let characteristic = uuids::parse(&characteristic)?;
        let data = encode_value(&value, format)?;
        let peripheral = self.find_peripheral(&device).await?;

        let mut operation = WriteValue {
            configuration: self.config.session.clone(),
            characteristic,
            data,
            with_response,
        };
        run_operation(&peripheral, &mut operation).await?;
        println!("Wrote {} to {}", value, uuids::short_string(&characteristic));
        Ok(())
    }

    async fn handle_listen(
        &self,
        device: String,
        characteristic: String,
        count: Option<usize>,
        format: ValueFormat,
    ) -> Result<()> {
        let characteristic = uuids::parse(&characteristic)?;
        let peripheral = self.find_peripheral(&device).await?;

        let mut operation = Listen {
            configuration: self.config.session.clone(),
            characteristic,
            count,
            format,
        };
        let received = run_operation(&peripheral, &mut operation).await?;
        info!("Received {} notifications", received);
        Ok(())
    }

    async fn handle_rssi(&self, device: String, samples: usize, interval: f64) -> Result<()> {
        let interval = poll_interval(interval)?;
        let peripheral = self.find_peripheral(&device).await?;
        let session = &self.config.session;

        let mut disconnection = peripheral.connect(session.connect_timeout).await?;
        let mut readings = peripheral.start_rssi_polling(Some(interval));

        let mut taken = 0;
        while taken < samples {
            match readings.recv().await {
                Some(Ok(Some(rssi))) => println!("{} dBm", rssi),
                Some(Ok(None)) => println!("(unavailable)"),
                Some(Err(e)) => warn!("RSSI read failed: {}", e),
                None => break,
            }
            taken += 1;
        }
        peripheral.stop_rssi_polling();

        if let Some(Some(e)) = disconnection.try_ended() {
            return Err(e.into());
        }
        peripheral.disconnect(session.disconnect_timeout).await?;
        Ok(())
    }

    async fn handle_info(&self, device: String) -> Result<()> {
        let peripheral = self.find_peripheral(&device).await?;
        let mut operation = ReadDeviceInformation::new(self.config.session.clone());
        let info = run_operation(&peripheral, &mut operation).await?;
        print!("{}", info);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn parse_uuids(inputs: &[String]) -> Result<Vec<Uuid>> {
    inputs
        .iter()
        .map(|input| uuids::parse(input).map_err(CliError::from))
        .collect()
}

fn poll_interval(seconds: f64) -> Result<Duration> {
    if !(seconds > 0.0) {
        return Err(CliError::InvalidValue(format!("interval must be positive, got {}", seconds)));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| CliError::InvalidValue(format!("interval of {} seconds: {}", seconds, e)))
}

fn match_target(nearby: &[PeripheralSnapshot], target: &str) -> Option<gattkit_core::DeviceId> {
    nearby
        .iter()
        .find(|p| p.id.as_str() == target || p.name.as_deref() == Some(target))
        .map(|p| p.id.clone())
}

fn attribute_label(uuid: &Uuid) -> String {
    match uuids::common_name(uuid) {
        Some(name) => format!("{} ({})", name, uuids::short_string(uuid)),
        None => uuids::short_string(uuid),
    }
}

fn print_nearby(nearby: &[PeripheralSnapshot]) {
    if nearby.is_empty() {
        println!("No peripherals found");
        return;
    }

    println!("{:<6} {:<24} {}", "RSSI", "NAME", "ID");
    for peripheral in nearby {
        let rssi = peripheral
            .rssi
            .map(|r| r.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("{:<6} {:<24} {}", rssi, peripheral.display_name(), peripheral.id);
        for service in &peripheral.service_uuids {
            println!("{:<6} {:<24}   advertises {}", "", "", attribute_label(service));
        }
    }
}

fn print_tree(services: &[Service]) {
    for service in services {
        let kind = if service.is_primary { "primary" } else { "secondary" };
        println!("  {} [{}]", attribute_label(&service.uuid), kind);
        for characteristic in &service.characteristics {
            println!(
                "    {} [{}]",
                attribute_label(&characteristic.uuid),
                characteristic.properties
            );
            for descriptor in &characteristic.descriptors {
                println!("      {}", attribute_label(&descriptor.uuid));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, name: Option<&str>) -> PeripheralSnapshot {
        let now = Instant::now();
        PeripheralSnapshot {
            id: gattkit_core::DeviceId::new(id),
            name: name.map(str::to_string),
            rssi: Some(-60),
            service_uuids: Vec::new(),
            manufacturer_data: Default::default(),
            is_connectable: true,
            first_seen: now,
            last_seen: now,
            advertisement_count: 1,
        }
    }

    #[test]
    fn test_match_target_by_id_or_name() {
        let nearby = vec![snapshot("dev-1", Some("Strap")), snapshot("dev-2", None)];
        assert_eq!(match_target(&nearby, "dev-2"), Some(gattkit_core::DeviceId::new("dev-2")));
        assert_eq!(match_target(&nearby, "Strap"), Some(gattkit_core::DeviceId::new("dev-1")));
        assert_eq!(match_target(&nearby, "Watch"), None);
    }

    #[test]
    fn test_parse_uuids() {
        let parsed = parse_uuids(&["180D".to_string(), "0x180f".to_string()]).unwrap();
        assert_eq!(parsed, vec![uuids::services::HEART_RATE, uuids::services::BATTERY]);
        assert!(matches!(parse_uuids(&["nope".to_string()]), Err(CliError::Ble(_))));
    }

    #[test]
    fn test_poll_interval() {
        assert_eq!(poll_interval(0.5).unwrap(), Duration::from_millis(500));
        assert!(matches!(poll_interval(0.0), Err(CliError::InvalidValue(_))));
        assert!(matches!(poll_interval(f64::NAN), Err(CliError::InvalidValue(_))));
        assert!(matches!(poll_interval(1e30), Err(CliError::InvalidValue(_))));
    }

    #[test]
    fn test_attribute_label() {
        assert_eq!(attribute_label(&uuids::services::BATTERY), "Battery (180F)");
        let custom = uuids::from_u16(0xFFA0);
        assert_eq!(attribute_label(&custom), "FFA0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_device_is_found_by_name() {
        let dispatcher = CommandDispatcher::new(AppConfig::default(), true).await.unwrap();
        let peripheral = dispatcher.find_peripheral(simulate::DEVICE_NAME).await.unwrap();
        assert_eq!(peripheral.id(), &simulate::device_id());

        let mut operation = ReadValue {
            configuration: AppConfig::default().session,
            characteristic: uuids::characteristics::BATTERY_LEVEL,
            format: ValueFormat::U8,
        };
        let value = run_operation(&peripheral, &mut operation).await.unwrap();
        assert_eq!(value.as_deref(), Some("87"));
    }
}
