use printbus::broker::Broker;
use printbus::bus::{BusClient, BusError, QoS};
use printbus::config::{BusConfig, ControllerConfig, StoreConfig};
use printbus::controller;
use printbus::protocol::{
    control_topic, decode_command, encode_telemetry, telemetry_topic, TelemetryRecord,
    CONTROL_SUBSCRIPTION, TELEMETRY_SUBSCRIPTION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::timeout;

const SETTLE: Duration = Duration::from_millis(150);
const DELIVERY: Duration = Duration::from_secs(5);

async fn start_broker(credentials: Option<(String, String)>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Arc::new(Broker::new(credentials));
    tokio::spawn(broker.serve(listener));
    addr
}

fn client_config(addr: SocketAddr, client_id: &str) -> BusConfig {
    BusConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        client_id: client_id.to_string(),
        username: None,
        password: None,
        max_connect_attempts: 3,
        connect_retry_delay: Duration::from_millis(50),
    }
}

fn telemetry(printer_id: &str, roughness: f64, print_speed: f64) -> TelemetryRecord {
    let mut record = TelemetryRecord::new(printer_id);
    record.set_number("roughness", roughness);
    record.set_number("print_speed", print_speed);
    record.set_number("nozzle_temperature", 220.0);
    record.set_number("bed_temperature", 70.0);
    record
}

/// A stand-in ingest socket that accepts connections and drains whatever the
/// store client writes.
async fn start_sink() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut sink = Vec::new();
                let _ = stream.read_to_end(&mut sink).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_publish_reaches_wildcard_subscriber() {
    let addr = start_broker(None).await;

    let publisher = BusClient::connect(&client_config(addr, "simulator")).await.unwrap();
    let consumer = BusClient::connect(&client_config(addr, "controller")).await.unwrap();
    let mut subscription = consumer.client.subscribe(TELEMETRY_SUBSCRIPTION).unwrap();
    tokio::time::sleep(SETTLE).await;

    let record = telemetry("printer_1", 42.0, 100.0);
    let payload = encode_telemetry(&record).unwrap();
    publisher
        .client
        .publish(&telemetry_topic("printer_1"), &payload, QoS::AtLeastOnce)
        .unwrap();

    let message = timeout(DELIVERY, subscription.next())
        .await
        .expect("delivery timed out")
        .expect("subscription closed");
    assert_eq!(message.topic, "printing/printer_1/sensor");
    assert_eq!(message.payload, payload);

    publisher.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_non_matching_topic_is_not_delivered() {
    let addr = start_broker(None).await;

    let publisher = BusClient::connect(&client_config(addr, "simulator")).await.unwrap();
    let consumer = BusClient::connect(&client_config(addr, "controller")).await.unwrap();
    let mut subscription = consumer.client.subscribe(TELEMETRY_SUBSCRIPTION).unwrap();
    tokio::time::sleep(SETTLE).await;

    publisher
        .client
        .publish("printer/status/printer_1", "{}", QoS::AtMostOnce)
        .unwrap();

    assert!(
        timeout(Duration::from_millis(300), subscription.next())
            .await
            .is_err(),
        "unrelated topic must not match the telemetry wildcard"
    );

    publisher.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_connect_exhausts_bounded_retries() {
    // Nothing listens on this address; grab a port and release it.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = probe.local_addr().unwrap();
    drop(probe);

    let config = client_config(dead_addr, "doomed");
    let error = BusClient::connect(&config).await.expect_err("must fail");
    match error {
        BusError::ConnectExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_bad_credentials_rejected() {
    let addr = start_broker(Some(("fleet".to_string(), "secret".to_string()))).await;

    let config = client_config(addr, "anonymous");
    let error = BusClient::connect(&config).await.expect_err("must reject");
    assert!(matches!(error, BusError::ConnectionRejected(_)));

    let authed = BusConfig {
        username: Some("fleet".to_string()),
        password: Some("secret".to_string()),
        ..client_config(addr, "operator")
    };
    let connection = BusClient::connect(&authed).await.expect("must accept");
    connection.shutdown().await;
}

/// End-to-end closed loop over a real broker: breach telemetry in, exactly
/// one control command out; quiet telemetry produces nothing.
#[tokio::test]
async fn test_controller_closes_the_loop() {
    let broker_addr = start_broker(None).await;
    let sink_addr = start_sink().await;

    let store_config = StoreConfig {
        host: sink_addr.ip().to_string(),
        port: sink_addr.port(),
    };
    let runtime = controller::start(
        &client_config(broker_addr, "controller"),
        &store_config,
        ControllerConfig::default(),
    )
    .await
    .unwrap();
    let controller::ControllerRuntime {
        mut controller,
        telemetry: telemetry_stream,
        bus: controller_bus,
        store,
    } = runtime;
    tokio::spawn(async move {
        controller.run(telemetry_stream).await;
    });

    // The simulator side: publishes telemetry, listens for commands.
    let simulator = BusClient::connect(&client_config(broker_addr, "simulator"))
        .await
        .unwrap();
    let mut commands = simulator.client.subscribe(CONTROL_SUBSCRIPTION).unwrap();
    tokio::time::sleep(SETTLE).await;

    // Acceptable roughness: no command may come back.
    let quiet = encode_telemetry(&telemetry("printer_1", 50.0, 100.0)).unwrap();
    simulator
        .client
        .publish(&telemetry_topic("printer_1"), &quiet, QoS::AtLeastOnce)
        .unwrap();
    assert!(
        timeout(Duration::from_millis(400), commands.next())
            .await
            .is_err(),
        "no command may be issued below the threshold"
    );

    // Threshold breach: exactly one command with the scenario values.
    let breach = encode_telemetry(&telemetry("printer_1", 80.0, 100.0)).unwrap();
    simulator
        .client
        .publish(&telemetry_topic("printer_1"), &breach, QoS::AtLeastOnce)
        .unwrap();

    let message = timeout(DELIVERY, commands.next())
        .await
        .expect("command delivery timed out")
        .expect("command stream closed");
    assert_eq!(message.topic, control_topic("printer_1"));
    let command = decode_command(&message.payload).unwrap();
    assert_eq!(command.printer_id, "printer_1");
    assert_eq!(command.original_speed, 100.0);
    assert_eq!(command.new_speed, 80.0);
    assert_eq!(command.reason, "roughness_threshold_exceeded_75");

    // One breach, one command.
    assert!(
        timeout(Duration::from_millis(300), commands.next())
            .await
            .is_err(),
        "a single breach must produce a single command"
    );

    simulator.shutdown().await;
    controller_bus.shutdown().await;
    store.shutdown().await;
}

/// Malformed payloads are dropped without stalling the pipeline.
#[tokio::test]
async fn test_malformed_telemetry_does_not_stall_controller() {
    let broker_addr = start_broker(None).await;
    let sink_addr = start_sink().await;

    let runtime = controller::start(
        &client_config(broker_addr, "controller"),
        &StoreConfig {
            host: sink_addr.ip().to_string(),
            port: sink_addr.port(),
        },
        ControllerConfig::default(),
    )
    .await
    .unwrap();
    let controller::ControllerRuntime {
        mut controller,
        telemetry: telemetry_stream,
        bus: controller_bus,
        store,
    } = runtime;
    tokio::spawn(async move {
        controller.run(telemetry_stream).await;
    });

    let simulator = BusClient::connect(&client_config(broker_addr, "simulator"))
        .await
        .unwrap();
    let mut commands = simulator.client.subscribe(CONTROL_SUBSCRIPTION).unwrap();
    tokio::time::sleep(SETTLE).await;

    // Garbage first, then a legitimate breach; the breach must still be
    // processed.
    simulator
        .client
        .publish(&telemetry_topic("printer_1"), "not json at all", QoS::AtLeastOnce)
        .unwrap();
    let breach = encode_telemetry(&telemetry("printer_1", 90.0, 50.0)).unwrap();
    simulator
        .client
        .publish(&telemetry_topic("printer_1"), &breach, QoS::AtLeastOnce)
        .unwrap();

    let message = timeout(DELIVERY, commands.next())
        .await
        .expect("command delivery timed out")
        .expect("command stream closed");
    let command = decode_command(&message.payload).unwrap();
    assert_eq!(command.new_speed, 40.0);

    simulator.shutdown().await;
    controller_bus.shutdown().await;
    store.shutdown().await;
}
