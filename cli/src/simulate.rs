// Simulated session: drives GattClientCore against the in-process radio
//
// Scan, connect to the strongest device, discover, subscribe, then
// interleave reads and writes before disconnecting.

use anyhow::{Context, Result};
use blenexus_core::{
    Characteristic, CharacteristicProperties, GattClientCore, GattConfig, ScanFilter, Service,
    SimulatedPeripheral, SimulatedRadio,
};
use colored::*;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const BATTERY_SERVICE: &str = "180F";
const BATTERY_LEVEL: &str = "2A19";
const DATA_SERVICE: &str = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E";
const DATA_RX: &str = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E";
const DATA_TX: &str = "6E400003-B5A3-F393-E0A9-E50E24DCCA9E";

const SCAN_WINDOW: Duration = Duration::from_millis(250);

pub struct SimulateOptions {
    pub devices: usize,
    pub rssi_threshold: i16,
    pub reads: usize,
}

fn peripheral(index: usize) -> SimulatedPeripheral {
    let rssi = -40 - (index as i16 % 8) * 9;
    SimulatedPeripheral::new(format!("5A:00:00:00:00:{:02X}", index))
        .with_name(format!("sim-{}", index))
        .with_rssi(rssi)
        .with_manufacturer_data(0xFFFF, vec![index as u8])
        .with_service(Service::new(
            BATTERY_SERVICE,
            vec![Characteristic::new(
                BATTERY_LEVEL,
                CharacteristicProperties::read_only(),
            )],
        ))
        .with_service(Service::new(
            DATA_SERVICE,
            vec![
                Characteristic::new(
                    DATA_RX,
                    CharacteristicProperties {
                        readable: true,
                        writable: true,
                        writable_without_response: true,
                        ..Default::default()
                    },
                ),
                Characteristic::new(
                    DATA_TX,
                    CharacteristicProperties {
                        notifiable: true,
                        ..Default::default()
                    },
                ),
            ],
        ))
        .with_value(BATTERY_SERVICE, BATTERY_LEVEL, vec![100 - index as u8 % 100])
}

pub async fn run(config: GattConfig, options: SimulateOptions) -> Result<()> {
    let step = config.operation_timeout() * 2;
    let (radio, events) = SimulatedRadio::auto_responding();
    let radio = Arc::new(radio);
    for index in 0..options.devices {
        radio.add_peripheral(peripheral(index));
    }

    let core = GattClientCore::new(radio.clone(), config)?;
    core.drive(events);

    println!("{}", "Scanning...".bold());
    let filter = ScanFilter::new().with_rssi_threshold(options.rssi_threshold);
    let mut scan = core.start_scan(filter)?;
    let mut found = Vec::new();
    while let Ok(Some(device)) = timeout(SCAN_WINDOW, scan.recv()).await {
        println!(
            "  {} {} {:>4} dBm  {}",
            "•".bright_green(),
            device.id.bright_cyan(),
            device.rssi.unwrap_or_default(),
            device.name.as_deref().unwrap_or("(unnamed)").dimmed()
        );
        for (company, data) in device.manufacturer_data.iter() {
            println!("      mfr 0x{:04X}: {}", company, hex::encode(data));
        }
        found.push(device);
    }
    core.stop_scan()?;

    let target = match found.iter().max_by_key(|d| d.rssi) {
        Some(device) => device.id.clone(),
        None => {
            println!("{}", "No devices above the RSSI threshold.".dimmed());
            return Ok(());
        }
    };
    println!();
    println!("{} {}", "Connecting to".bold(), target.bright_cyan());

    timeout(step, core.connect(&target))
        .await
        .context("Connect timed out")??;
    let services = timeout(step, core.discover_services(&target, None))
        .await
        .context("Discovery timed out")??;
    for service in &services {
        println!("  {} service {}", "✓".green(), service.id);
        for characteristic in &service.characteristics {
            println!("      {}", characteristic.id.dimmed());
        }
    }

    let mut notifications = timeout(
        step,
        core.subscribe_to_characteristic(&target, DATA_SERVICE, DATA_TX, None),
    )
    .await
    .context("Subscribe timed out")??;
    println!("  {} subscribed to {}", "✓".green(), DATA_TX);

    // queue everything at once; the core serialises it
    let mut writes = Vec::with_capacity(options.reads);
    let mut reads = Vec::with_capacity(options.reads);
    for i in 0..options.reads {
        let payload = format!("msg-{}", i).into_bytes();
        writes.push(core.write_characteristic(&target, DATA_SERVICE, DATA_RX, payload, true, None));
        reads.push(core.read_characteristic(&target, DATA_SERVICE, DATA_RX, None));
    }
    for (i, result) in join_all(writes).await.into_iter().enumerate() {
        result.with_context(|| format!("Write {} failed", i))?;
    }
    for (i, value) in join_all(reads).await.into_iter().enumerate() {
        let value = value.with_context(|| format!("Read {} failed", i))?;
        println!("  read {:>2}: {}", i, hex::encode(&value).bright_yellow());
    }

    let level = timeout(
        step,
        core.read_characteristic(&target, BATTERY_SERVICE, BATTERY_LEVEL, None),
    )
    .await
    .context("Read timed out")??;
    println!("  battery: {}%", level.first().copied().unwrap_or_default());

    radio.notify(&target, DATA_SERVICE, DATA_TX, b"hello".to_vec());
    if let Ok(Some(n)) = timeout(SCAN_WINDOW, notifications.recv()).await {
        println!("  notified: {}", hex::encode(&n.value).bright_yellow());
    }

    timeout(step, core.disconnect(&target))
        .await
        .context("Disconnect timed out")??;
    println!();
    println!("{} {}", "Disconnected from".bold(), target.bright_cyan());
    println!("  {} devices remain in the registry", core.devices().len());

    Ok(())
}
