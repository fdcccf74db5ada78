use clap::{App, Arg};
use printbus::bus::{BusClient, QoS};
use printbus::config::{
    BusConfig, SimulatorConfig, DEFAULT_BASE_RATE_HZ, DEFAULT_BUS_HOST, DEFAULT_BUS_PORT,
    DEFAULT_PRINTER_COUNT, DEFAULT_SPIKE_MAGNITUDE, DEFAULT_SPIKE_PROBABILITY,
};
use printbus::protocol::{
    decode_command, encode_telemetry, telemetry_topic, CONTROL_SUBSCRIPTION,
};
use printbus::simulator::{printer_id, PlantSimulator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{info, warn};

// Steady-state operator visibility without flooding the log at 100 Hz.
const STATS_LOG_INTERVAL_TICKS: u64 = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("printbus-simulator")
        .version("0.1.0")
        .about("Synthetic print-fleet plant: telemetry generation, anomaly injection, feedback loop")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Bus broker host")
                .takes_value(true)
                .default_value(DEFAULT_BUS_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Bus broker port")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("printers")
                .short("n")
                .long("printers")
                .value_name("COUNT")
                .help("Number of simulated devices")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("rate")
                .short("r")
                .long("rate")
                .value_name("HZ")
                .help("Generation rate across the fleet")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dataset")
                .short("d")
                .long("dataset")
                .value_name("CSV")
                .help("Reference dataset used to seed device base parameters")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("spike-probability")
                .long("spike-probability")
                .value_name("P")
                .help("Per-cycle spike probability")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("spike-magnitude")
                .long("spike-magnitude")
                .value_name("FACTOR")
                .help("Spike multiplier")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("no-feedback")
                .long("no-feedback")
                .help("Ignore control commands instead of folding them into device state"),
        )
        .get_matches();

    let bus_port: u16 = match matches.value_of("port") {
        Some(raw) => raw.parse()?,
        None => DEFAULT_BUS_PORT,
    };
    let bus_config = BusConfig::new(matches.value_of("host").unwrap(), bus_port, "simulator");

    let mut config = SimulatorConfig {
        printer_count: match matches.value_of("printers") {
            Some(raw) => raw.parse()?,
            None => DEFAULT_PRINTER_COUNT,
        },
        base_rate_hz: match matches.value_of("rate") {
            Some(raw) => raw.parse()?,
            None => DEFAULT_BASE_RATE_HZ,
        },
        dataset_path: matches.value_of("dataset").map(PathBuf::from),
        feedback_enabled: !matches.is_present("no-feedback"),
        ..SimulatorConfig::default()
    };
    config.anomaly.spike_probability = match matches.value_of("spike-probability") {
        Some(raw) => raw.parse()?,
        None => DEFAULT_SPIKE_PROBABILITY,
    };
    config.anomaly.spike_magnitude = match matches.value_of("spike-magnitude") {
        Some(raw) => raw.parse()?,
        None => DEFAULT_SPIKE_MAGNITUDE,
    };
    if config.base_rate_hz <= 0.0 {
        eprintln!("fatal: generation rate must be positive");
        std::process::exit(1);
    }
    if config.printer_count == 0 {
        eprintln!("fatal: printer count must be at least 1");
        std::process::exit(1);
    }

    println!(
        "🖨️  printbus simulator starting: {} printers at {} Hz",
        config.printer_count, config.base_rate_hz
    );

    let bus = match BusClient::connect(&bus_config).await {
        Ok(bus) => bus,
        Err(error) => {
            eprintln!("fatal: {}", error);
            std::process::exit(1);
        }
    };

    let printer_count = config.printer_count;
    let rate_hz = config.base_rate_hz;
    let feedback_enabled = config.feedback_enabled;
    let plant = Arc::new(Mutex::new(PlantSimulator::new(config)));

    // Feedback arrives on a bus-delivery task while the generation loop
    // runs; both paths take the plant lock, so a command is either fully
    // visible to a cycle or not at all.
    if feedback_enabled {
        let mut control = bus.client.subscribe(CONTROL_SUBSCRIPTION)?;
        let feedback_plant = Arc::clone(&plant);
        tokio::spawn(async move {
            while let Some(message) = control.next().await {
                match decode_command(&message.payload) {
                    Ok(command) => {
                        feedback_plant.lock().await.apply_feedback(command);
                    }
                    Err(error) => {
                        warn!(%error, "dropping malformed control command");
                    }
                }
            }
        });
    }

    // Fixed-rate scheduler; an overrunning tick schedules the next one
    // immediately instead of accumulating negative sleep.
    let mut interval = time::interval(Duration::from_secs_f64(1.0 / rate_hz));
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                println!("\n🛑 simulator shutting down");
                break;
            }
        }

        {
            let mut plant = plant.lock().await;
            for index in 1..=printer_count {
                let device = printer_id(index);
                let record = plant.generate_record(&device);
                match encode_telemetry(&record) {
                    Ok(payload) => {
                        if let Err(error) =
                            bus.client
                                .publish(&telemetry_topic(&device), &payload, QoS::AtLeastOnce)
                        {
                            warn!(%error, "telemetry publish failed, stopping");
                            bus.shutdown().await;
                            return Ok(());
                        }
                    }
                    Err(error) => {
                        warn!(printer_id = %device, %error, "failed to encode telemetry record");
                    }
                }
            }

            tick += 1;
            if tick % STATS_LOG_INTERVAL_TICKS == 0 {
                let stats = plant.anomaly_stats();
                info!(
                    tick,
                    spikes = stats.spikes_injected,
                    drifts_started = stats.drifts_started,
                    "generation cycle stats"
                );
            }
        }
    }

    bus.shutdown().await;
    println!("simulator stopped");
    Ok(())
}
