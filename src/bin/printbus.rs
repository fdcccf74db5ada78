use clap::{App, Arg, SubCommand};
use colored::*;
use printbus::bus::BusClient;
use printbus::config::{
    BusConfig, DEFAULT_BUS_HOST, DEFAULT_BUS_PORT, DEFAULT_ROUGHNESS_THRESHOLD,
};
use printbus::protocol::{
    decode_command, decode_telemetry, CONTROL_SUBSCRIPTION, TELEMETRY_SUBSCRIPTION,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("printbus")
        .version("0.1.0")
        .about("🖨️  Print-fleet operator console")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Bus broker host")
                .takes_value(true)
                .default_value(DEFAULT_BUS_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Bus broker port")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("📈 Watch the live telemetry stream")
                .arg(
                    Arg::with_name("threshold")
                        .short("t")
                        .long("threshold")
                        .value_name("ROUGHNESS")
                        .help("Highlight records above this roughness")
                        .takes_value(true),
                ),
        )
        .subcommand(SubCommand::with_name("commands").about("🎛  Tail the control command stream"))
        .get_matches();

    let host = matches.value_of("host").unwrap();
    let port: u16 = match matches.value_of("port") {
        Some(raw) => raw.parse()?,
        None => DEFAULT_BUS_PORT,
    };
    let format = matches.value_of("format").unwrap().to_string();

    match matches.subcommand() {
        ("monitor", Some(sub_matches)) => {
            let threshold: f64 = match sub_matches.value_of("threshold") {
                Some(raw) => raw.parse()?,
                None => DEFAULT_ROUGHNESS_THRESHOLD,
            };
            monitor_telemetry(host, port, &format, threshold).await?;
        }
        ("commands", _) => {
            monitor_commands(host, port, &format).await?;
        }
        _ => {
            println!(
                "{}",
                "No command specified. Use --help for usage information.".yellow()
            );
            println!("{}", "Quick start:".bright_green());
            println!(
                "  {} Watch live telemetry",
                "printbus monitor".bright_cyan()
            );
            println!(
                "  {} Tail control commands",
                "printbus commands".bright_cyan()
            );
        }
    }

    Ok(())
}

async fn monitor_telemetry(
    host: &str,
    port: u16,
    format: &str,
    threshold: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = BusConfig::new(host, port, "printbus-cli");
    let bus = BusClient::connect(&config).await?;
    let mut telemetry = bus.client.subscribe(TELEMETRY_SUBSCRIPTION)?;

    println!(
        "{}",
        "📡 Monitoring fleet telemetry (Press Ctrl+C to stop)..."
            .bright_blue()
            .bold()
    );
    if format == "table" {
        println!(
            "{}",
            "│ Cycle    │ Printer      │ Roughness │ Speed    │ Nozzle   │ Bed      │ Anomaly"
                .bright_white()
        );
    }

    loop {
        let message = tokio::select! {
            message = telemetry.next() => message,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(message) = message else { break };

        match format {
            "json" => println!("{}", message.payload),
            "compact" => {
                if let Ok(record) = decode_telemetry(&message.payload) {
                    let roughness = record.roughness().unwrap_or(0.0);
                    let status = if roughness > threshold {
                        "HIGH".red()
                    } else {
                        "OK".green()
                    };
                    println!(
                        "[{}] {} | roughness {:.2} | speed {:.2}",
                        record.printer_id,
                        status,
                        roughness,
                        record.print_speed().unwrap_or(0.0)
                    );
                }
            }
            _ => {
                if let Ok(record) = decode_telemetry(&message.payload) {
                    let roughness = record.roughness().unwrap_or(0.0);
                    let roughness_cell = if roughness > threshold {
                        format!("{:>9.2}", roughness).red()
                    } else {
                        format!("{:>9.2}", roughness).green()
                    };
                    let anomaly_cell = match record.anomaly.as_deref() {
                        Some(tag) => tag.bright_yellow(),
                        None => "-".dimmed(),
                    };
                    println!(
                        "│ {:>8} │ {:<12} │ {} │ {:>8.2} │ {:>8.2} │ {:>8.2} │ {}",
                        record.cycle_count.unwrap_or(0),
                        record.printer_id,
                        roughness_cell,
                        record.print_speed().unwrap_or(0.0),
                        record.nozzle_temperature().unwrap_or(0.0),
                        record.bed_temperature().unwrap_or(0.0),
                        anomaly_cell
                    );
                }
            }
        }
    }

    bus.shutdown().await;
    Ok(())
}

async fn monitor_commands(
    host: &str,
    port: u16,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = BusConfig::new(host, port, "printbus-cli");
    let bus = BusClient::connect(&config).await?;
    let mut commands = bus.client.subscribe(CONTROL_SUBSCRIPTION)?;

    println!(
        "{}",
        "🎛  Tailing control commands (Press Ctrl+C to stop)..."
            .bright_blue()
            .bold()
    );

    loop {
        let message = tokio::select! {
            message = commands.next() => message,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(message) = message else { break };

        match format {
            "json" => println!("{}", message.payload),
            _ => {
                if let Ok(command) = decode_command(&message.payload) {
                    println!(
                        "{} {} {} → {} ({})",
                        "⚙".bright_cyan(),
                        command.printer_id.bright_white(),
                        format!("{:.2}", command.original_speed).yellow(),
                        format!("{:.2}", command.new_speed).bright_green(),
                        command.reason.dimmed()
                    );
                }
            }
        }
    }

    bus.shutdown().await;
    Ok(())
}
