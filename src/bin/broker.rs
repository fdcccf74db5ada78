use clap::{App, Arg};
use printbus::broker::Broker;
use printbus::config::{DEFAULT_BUS_HOST, DEFAULT_BUS_PORT};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("printbus-broker")
        .version("0.1.0")
        .about("Lightweight pub/sub broker for the print-fleet control loop")
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .value_name("ADDR")
                .help("Listen address")
                .takes_value(true)
                .default_value(DEFAULT_BUS_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Listen port")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("username")
                .long("username")
                .value_name("USER")
                .help("Require this username from connecting clients")
                .takes_value(true)
                .requires("password"),
        )
        .arg(
            Arg::with_name("password")
                .long("password")
                .value_name("PASS")
                .help("Require this password from connecting clients")
                .takes_value(true)
                .requires("username"),
        )
        .get_matches();

    let bind = matches.value_of("bind").unwrap();
    let port: u16 = match matches.value_of("port") {
        Some(raw) => raw.parse()?,
        None => DEFAULT_BUS_PORT,
    };
    let credentials = match (matches.value_of("username"), matches.value_of("password")) {
        (Some(username), Some(password)) => Some((username.to_string(), password.to_string())),
        _ => None,
    };

    let listener = TcpListener::bind(format!("{}:{}", bind, port)).await?;
    println!("🖨️  printbus broker listening on {}:{}", bind, port);

    let broker = Arc::new(Broker::new(credentials));
    tokio::select! {
        result = broker.serve(listener) => {
            if let Err(err) = result {
                error!(%err, "broker accept loop failed");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\n🛑 broker shutting down");
        }
    }

    Ok(())
}
