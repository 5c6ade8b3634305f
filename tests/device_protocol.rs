//! Modbus client against the device simulator's register server over loopback TCP.

use std::sync::Arc;

use chrono::NaiveDate;
use gridcast::domain::{NoHolidays, Observation};
use gridcast::forecast::FeatureExtractor;
use gridcast::modbus::{ModbusClient, RegisterDevice, RegisterServer};
use gridcast::simulation::{DeviceConfig, DeviceSimulator};
use tokio_util::sync::CancellationToken;

fn trace(start: NaiveDate, hours: &[f64]) -> Vec<Observation> {
    let extractor = FeatureExtractor::new(Arc::new(NoHolidays));
    let start = start.and_hms_opt(22, 0, 0).unwrap();
    hours
        .iter()
        .enumerate()
        .map(|(i, &energy_kwh)| {
            let timestamp = start + chrono::Duration::hours(i as i64);
            Observation {
                timestamp,
                features: extractor.extract(timestamp),
                energy_kwh,
            }
        })
        .collect()
}

type ServerTask = tokio::task::JoinHandle<std::io::Result<()>>;

async fn serve(sim: &DeviceSimulator) -> (ModbusClient, CancellationToken, ServerTask) {
    let server = RegisterServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(server.serve(sim.block(), shutdown.clone()));
    let client = ModbusClient::connect(&addr.to_string(), 1).await.unwrap();
    (client, shutdown, task)
}

#[tokio::test]
async fn test_client_reads_published_state_and_commands_grid() {
    let day = NaiveDate::from_ymd_opt(2025, 6, 7).unwrap();
    let mut sim = DeviceSimulator::new(DeviceConfig::default(), trace(day, &[12.7, 10.0, 10.0]));
    let (client, shutdown, task) = serve(&sim).await;

    // Initial block has no date yet.
    assert!(client.read_frame().await.is_err());

    let step = sim.step().await.unwrap();
    let frame = client.read_frame().await.unwrap();
    assert_eq!(frame.date, day);
    assert_eq!(frame.hour, 22);
    assert_eq!(frame.demand_kw, 12);
    assert!(frame.grid_connected);
    assert_eq!(frame.soc_percent, (step.soc_kwh / 240.0 * 100.0) as u16);

    client.write_grid_connected(false).await.unwrap();
    let before = sim.soc_kwh();
    let step = sim.step().await.unwrap();
    assert!(!step.grid_connected);
    assert_eq!(step.soc_kwh, before - 10.0);

    // Date rolls over at midnight.
    sim.step().await.unwrap();
    let frame = client.read_frame().await.unwrap();
    assert_eq!(frame.date, day.succ_opt().unwrap());
    assert_eq!(frame.hour, 0);
    assert!(!frame.grid_connected);

    client.close().await.unwrap();
    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_grid_flag_rejects_non_boolean() {
    let day = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
    let mut sim = DeviceSimulator::new(DeviceConfig::default(), trace(day, &[1.0]));
    sim.step().await.unwrap();
    let (client, shutdown, task) = serve(&sim).await;

    assert!(client.write_single_register(3, 2).await.is_err());
    assert!(sim.block().grid_connected().await);

    let frame = client.read_frame().await.unwrap();
    assert_eq!(frame.hour, 22);
    assert!(frame.grid_connected);

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unreachable_device_fails_to_connect() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    assert!(ModbusClient::connect(&addr.to_string(), 1).await.is_err());
}
