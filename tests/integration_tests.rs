//! Integration Tests for procimg_modbus
//!
//! A real TCP slave on an ephemeral port, driven by TCP masters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use procimg_modbus::*;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn start_server(registry: DeviceRegistry) -> ModbusTcpServer {
    init_logger();
    let mut server = ModbusTcpServer::new("127.0.0.1:0", Arc::new(registry)).unwrap();
    server.start().await.unwrap();
    server
}

async fn connect(server: &ModbusTcpServer) -> ModbusTcpClient {
    let config = MasterConfig {
        timeout_ms: 2000,
        retries: 1,
    };
    ModbusTcpClient::connect(server.local_addr().unwrap(), config).await.unwrap()
}

#[tokio::test]
async fn test_write_then_read_coils() {
    let image = Arc::new(ProcessImage::new(0, 16, 0, 0));
    let mut server = start_server(DeviceRegistry::new().with_device(Device::slave(15, image.clone()))).await;
    let client = connect(&server).await;

    client.write_multiple_coils(15, 5, &[true, true, true]).await.unwrap();
    assert_eq!(client.read_coils(15, 5, 3).await.unwrap(), vec![true, true, true]);
    assert_eq!(client.read_coils(15, 4, 5).await.unwrap(), vec![false, true, true, true, false]);
    assert_eq!(image.get_coils(5, 3).unwrap(), vec![true; 3]);

    client.write_single_coil(15, 6, false).await.unwrap();
    assert_eq!(image.get_coils(5, 3).unwrap(), vec![true, false, true]);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_registers_round_trip() {
    let image = Arc::new(
        ProcessImage::builder()
            .holding_registers(20)
            .input_register_values(&[100, 200, 300])
            .digital_input_values(&[true, false, true])
            .build(),
    );
    let mut server = start_server(DeviceRegistry::new().with_device(Device::slave(1, image.clone()))).await;
    let client = connect(&server).await;

    client.write_multiple_registers(1, 10, &[0x1234, 0xABCD]).await.unwrap();
    client.write_single_register(1, 12, 7).await.unwrap();
    assert_eq!(client.read_holding_registers(1, 10, 3).await.unwrap(), vec![0x1234, 0xABCD, 7]);
    assert_eq!(client.read_input_registers(1, 0, 3).await.unwrap(), vec![100, 200, 300]);
    assert_eq!(client.read_discrete_inputs(1, 0, 3).await.unwrap(), vec![true, false, true]);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_out_of_range_request_gets_exception() {
    let image = Arc::new(ProcessImage::new(0, 16, 0, 10));
    let mut server = start_server(DeviceRegistry::new().with_device(Device::slave(15, image.clone()))).await;
    let client = connect(&server).await;

    match client.read_holding_registers(15, 100, 5).await {
        Err(ModbusError::Exception { function, code, .. }) => {
            assert_eq!(function, 0x03);
            assert_eq!(code, 0x02);
        }
        other => panic!("expected exception, got {:?}", other),
    }

    // The image is untouched by a write that does not fit
    let error = client.write_multiple_registers(15, 8, &[1, 2, 3]).await.unwrap_err();
    assert!(matches!(error, ModbusError::Exception { code: 0x02, .. }));
    assert_eq!(image.get_holding_registers(0, 10).unwrap(), vec![0; 10]);

    // Exceptions arrive through execute as ordinary responses
    let response = client
        .execute(&RequestAdu::new(15, Request::read_coils(16, 1)))
        .await
        .unwrap();
    assert!(response.response().is_exception());
    assert_eq!(response.response().function_code(), 0x81);

    // The connection is still usable afterwards
    client.write_single_register(15, 0, 42).await.unwrap();
    assert_eq!(client.read_holding_registers(15, 0, 1).await.unwrap(), vec![42]);

    let stats = server.get_stats();
    assert_eq!(stats.exception_responses, 3);
    assert_eq!(stats.total_requests, 5);
    assert_eq!(stats.connections_count, 1);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unit_routing() {
    let first = Arc::new(ProcessImage::builder().holding_register_values(&[1, 1]).build());
    let shadowed = Arc::new(ProcessImage::builder().holding_register_values(&[9, 9]).build());
    let second = Arc::new(ProcessImage::builder().holding_register_values(&[2, 2]).build());
    let registry = DeviceRegistry::new()
        .with_device(Device::slave(1, first))
        .with_device(Device::slave(1, shadowed))
        .with_device(Device::slave(2, second))
        .with_device(Device::new(3, DeviceRole::Master));
    let mut server = start_server(registry).await;
    let client = connect(&server).await;

    assert_eq!(client.read_holding_registers(1, 0, 2).await.unwrap(), vec![1, 1]);
    assert_eq!(client.read_holding_registers(2, 0, 2).await.unwrap(), vec![2, 2]);

    for unit_id in [3, 7] {
        let error = client.read_holding_registers(unit_id, 0, 1).await.unwrap_err();
        assert!(matches!(error, ModbusError::Exception { code: 0x01, .. }));
    }

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_masters_disjoint_ranges() {
    let image = Arc::new(ProcessImage::new(0, 0, 0, 40));
    let mut server = start_server(DeviceRegistry::new().with_device(Device::slave(1, image.clone()))).await;

    let mut tasks = Vec::new();
    for worker in 0..4u16 {
        let client = connect(&server).await;
        tasks.push(tokio::spawn(async move {
            let values: Vec<u16> = (0..10).map(|i| worker * 100 + i).collect();
            for _ in 0..20 {
                client.write_multiple_registers(1, worker * 10, &values).await.unwrap();
                let read = client.read_holding_registers(1, worker * 10, 10).await.unwrap();
                assert_eq!(read, values);
            }
            client.close().await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for worker in 0..4u16 {
        let expected: Vec<u16> = (0..10).map(|i| worker * 100 + i).collect();
        assert_eq!(image.get_holding_registers(worker * 10, 10).unwrap(), expected);
    }
    assert_eq!(server.get_stats().connections_count, 4);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_overlapping_writes_never_interleave() {
    let image = Arc::new(ProcessImage::new(0, 0, 0, 50));
    let mut server = start_server(DeviceRegistry::new().with_device(Device::slave(1, image.clone()))).await;

    let mut writers = Vec::new();
    for value in [0x1111u16, 0x2222] {
        let client = connect(&server).await;
        writers.push(tokio::spawn(async move {
            for _ in 0..50 {
                client.write_multiple_registers(1, 0, &[value; 50]).await.unwrap();
            }
            client.close().await
        }));
    }

    let reader = connect(&server).await;
    for _ in 0..50 {
        let snapshot = reader.read_holding_registers(1, 0, 50).await.unwrap();
        assert!(
            snapshot.iter().all(|v| *v == snapshot[0]),
            "torn read: {:?}",
            snapshot
        );
    }

    for writer in writers {
        writer.await.unwrap().unwrap();
    }
    let last = image.get_holding_registers(0, 50).unwrap();
    assert!(last == vec![0x1111; 50] || last == vec![0x2222; 50]);

    reader.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_registry_from_config() {
    let config = RegistryConfig::from_yaml_str(
        r#"
devices:
  - unit_id: 5
    process_image:
      coils: 8
      holding_register_values: [10, 20, 30]
  - unit_id: 6
    role: master
"#,
    )
    .unwrap();
    let registry = DeviceRegistry::from_config(&config);
    let mut server = start_server(registry).await;
    let client = connect(&server).await;

    assert_eq!(client.read_holding_registers(5, 1, 2).await.unwrap(), vec![20, 30]);
    assert_eq!(client.read_coils(5, 0, 8).await.unwrap(), vec![false; 8]);
    assert!(client.read_coils(6, 0, 1).await.is_err());

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_housekeeping_and_shutdown() {
    init_logger();
    let runs = Arc::new(AtomicU64::new(0));
    let counter = runs.clone();
    let registry = Arc::new(DeviceRegistry::new().with_device(Device::slave(1, Arc::new(ProcessImage::new(0, 4, 0, 0)))));
    let dispatcher = Dispatcher::new(registry).with_housekeeping(server::DEFAULT_HOUSEKEEPING_INTERVAL, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let config = ModbusTcpServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        max_connections: 2,
        packet_logging: true,
    };
    let mut server = ModbusTcpServer::with_dispatcher(config, dispatcher).unwrap();
    server.start().await.unwrap();
    let client = connect(&server).await;

    for _ in 0..30 {
        client.read_coils(1, 0, 4).await.unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(server.get_stats().total_requests, 30);

    // Stopping drops the open connection
    server.stop().await.unwrap();
    assert!(!server.is_running());
    assert!(client.read_coils(1, 0, 4).await.is_err());
}
