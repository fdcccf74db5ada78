use clap::{App, Arg};
use printbus::config::{
    BusConfig, ControllerConfig, StoreConfig, DEFAULT_ADJUSTMENT_FACTOR, DEFAULT_BUS_HOST,
    DEFAULT_BUS_PORT, DEFAULT_FLOOR_SPEED, DEFAULT_ROUGHNESS_THRESHOLD, DEFAULT_STORE_HOST,
    DEFAULT_STORE_PORT,
};
use printbus::controller::{self, ControllerRuntime};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("printbus-controller")
        .version("0.1.0")
        .about("Real-time roughness controller: ingest, persist, score, correct")
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
            Arg::with_name("threshold")
                .short("t")
                .long("threshold")
                .value_name("ROUGHNESS")
                .help("Roughness threshold above which a correction is issued")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("adjustment-factor")
                .long("adjustment-factor")
                .value_name("FACTOR")
                .help("Multiplier applied to print speed on correction")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("floor-speed")
                .long("floor-speed")
                .value_name("SPEED")
                .help("Hard minimum for corrected print speed")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("model-path")
                .short("m")
                .long("model-path")
                .value_name("PATH")
                .help("Trained model artifact (falls back to the stochastic model on load failure)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("store-host")
                .long("store-host")
                .value_name("HOST")
                .help("Time-series store ingest host")
                .takes_value(true)
                .default_value(DEFAULT_STORE_HOST),
        )
        .arg(
            Arg::with_name("store-port")
                .long("store-port")
                .value_name("PORT")
                .help("Time-series store ingest port")
                .takes_value(true),
        )
        .get_matches();

    let bus_port: u16 = match matches.value_of("port") {
        Some(raw) => raw.parse()?,
        None => DEFAULT_BUS_PORT,
    };
    let bus_config = BusConfig::new(matches.value_of("host").unwrap(), bus_port, "controller");

    let store_config = StoreConfig {
        host: matches.value_of("store-host").unwrap().to_string(),
        port: match matches.value_of("store-port") {
            Some(raw) => raw.parse()?,
            None => DEFAULT_STORE_PORT,
        },
    };

    let config = ControllerConfig {
        roughness_threshold: match matches.value_of("threshold") {
            Some(raw) => raw.parse()?,
            None => DEFAULT_ROUGHNESS_THRESHOLD,
        },
        adjustment_factor: match matches.value_of("adjustment-factor") {
            Some(raw) => raw.parse()?,
            None => DEFAULT_ADJUSTMENT_FACTOR,
        },
        floor_speed: match matches.value_of("floor-speed") {
            Some(raw) => raw.parse()?,
            None => DEFAULT_FLOOR_SPEED,
        },
        model_path: matches.value_of("model-path").map(PathBuf::from),
    };

    println!("📡 printbus controller starting");
    let runtime = match controller::start(&bus_config, &store_config, config).await {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("fatal: {}", error);
            std::process::exit(1);
        }
    };
    let ControllerRuntime {
        mut controller,
        telemetry,
        bus,
        store,
    } = runtime;

    tokio::select! {
        _ = controller.run(telemetry) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\n🛑 controller shutting down");
        }
    }

    let stats = controller.stats();
    println!(
        "processed {} messages, published {} commands",
        stats.messages_processed, stats.commands_published
    );

    bus.shutdown().await;
    store.shutdown().await;
    Ok(())
}
