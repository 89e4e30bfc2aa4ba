//! tidemq - command line MQTT client.

mod config;

use std::error::Error;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{error, info, warn};
use tidemq_client::{Client, ClientEvent, QoS};
use tidemq_net::Dispatcher;

use crate::config::Config;

type BoxResult<T> = std::result::Result<T, Box<dyn Error>>;

enum Command {
    Publish { topic: String, message: String },
    Subscribe { topics: Vec<String> },
}

struct Args {
    config_path: String,
    qos: Option<u8>,
    retain: bool,
    command: Command,
}

fn usage() {
    println!("tidemq - MQTT 3.1.1 command line client");
    println!();
    println!("Usage: tidemq [OPTIONS] pub <TOPIC> <MESSAGE>");
    println!("       tidemq [OPTIONS] sub <TOPIC>...");
    println!();
    println!("Options:");
    println!("  -c, --config <FILE>     Config file path (default: tidemq.toml)");
    println!("  -q, --qos <0|1|2>       QoS for publishing and subscribing");
    println!("  -r, --retain            Publish as a retained message");
    println!("  -h, --help              Show this help message");
    println!();
    println!("Configuration:");
    println!("  Config file uses TOML format. All settings can be overridden");
    println!("  with environment variables using TIDEMQ__ prefix:");
    println!();
    println!("  TIDEMQ__MQTT__BROKER=broker.local:1883");
    println!("  TIDEMQ__MQTT__CLIENT_ID=probe");
    println!("  TIDEMQ__TLS__ENABLED=true");
    println!("  TIDEMQ__LOG__LEVEL=debug");
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    eprintln!("Use --help for usage information");
    std::process::exit(1);
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = "tidemq.toml".to_string();
    let mut qos = None;
    let mut retain = false;
    let mut positional = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                let Some(path) = args.get(i + 1) else {
                    fail("-c requires a file path");
                };
                config_path = path.clone();
                i += 2;
            }
            "-q" | "--qos" => {
                match args.get(i + 1).and_then(|q| q.parse::<u8>().ok()) {
                    Some(level) if level <= 2 => qos = Some(level),
                    _ => fail("-q requires 0, 1, or 2"),
                }
                i += 2;
            }
            "-r" | "--retain" => {
                retain = true;
                i += 1;
            }
            "-h" | "--help" => {
                usage();
                std::process::exit(0);
            }
            arg if arg.starts_with('-') => fail(&format!("Unknown argument: {}", arg)),
            arg => {
                positional.push(arg.to_string());
                i += 1;
            }
        }
    }

    let command = match positional.split_first() {
        Some((command, rest)) if command == "pub" => match rest {
            [topic, message] => Command::Publish {
                topic: topic.clone(),
                message: message.clone(),
            },
            _ => fail("pub takes a topic and a message"),
        },
        Some((command, rest)) if command == "sub" => {
            if rest.is_empty() {
                fail("sub takes at least one topic");
            }
            Command::Subscribe {
                topics: rest.to_vec(),
            }
        }
        Some((command, _)) => fail(&format!("Unknown command: {}", command)),
        None => fail("Missing command"),
    };

    Args {
        config_path,
        qos,
        retain,
        command,
    }
}

/// Wait for the broker to accept the connection.
fn wait_connected(events: &Receiver<ClientEvent>, timeout: Duration) -> BoxResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(left) {
            Ok(ClientEvent::Connected { session_present }) => {
                info!("Connected (session present: {})", session_present);
                return Ok(());
            }
            Ok(ClientEvent::Refused(code)) => {
                return Err(format!("Broker refused connection: {:?}", code).into())
            }
            Ok(ClientEvent::Disconnected { reason }) => warn!("Disconnected: {}", reason),
            Ok(ClientEvent::Reconnecting { attempt, .. }) => info!("Reconnecting ({})", attempt),
            Ok(ClientEvent::Message(_)) => {}
            Err(RecvTimeoutError::Timeout) => {
                return Err("Timed out connecting to broker".into())
            }
            Err(RecvTimeoutError::Disconnected) => return Err("Client stopped".into()),
        }
    }
}

fn publish(
    client: &Client,
    events: &Receiver<ClientEvent>,
    config: &Config,
    topic: &str,
    message: String,
    qos: QoS,
    retain: bool,
) -> BoxResult<()> {
    let ack_timeout = config.client_config().ack_timeout;
    wait_connected(events, ack_timeout * 2)?;
    client.publish(topic, message.into_bytes(), qos, retain)?;

    let deadline = Instant::now() + ack_timeout * 2;
    while client.pending_publishes() > 0 {
        if Instant::now() >= deadline {
            return Err("Timed out waiting for the broker to acknowledge".into());
        }
        match events.recv_timeout(config.net.tick()) {
            Ok(ClientEvent::Refused(code)) => {
                return Err(format!("Broker refused connection: {:?}", code).into())
            }
            Ok(event) => info!("{:?}", event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Err("Client stopped".into()),
        }
    }
    info!("Published to {} with {:?}", topic, qos);

    client.disconnect()?;
    let linger = config.client_config().disconnect_linger * 2;
    while let Ok(event) = events.recv_timeout(linger) {
        if let ClientEvent::Disconnected { .. } = event {
            break;
        }
    }
    Ok(())
}

fn subscribe(
    client: &Client,
    events: &Receiver<ClientEvent>,
    topics: &[String],
    qos: QoS,
) -> BoxResult<()> {
    for topic in topics {
        client.subscribe(topic, qos);
    }

    for event in events.iter() {
        match event {
            ClientEvent::Message(message) => {
                println!(
                    "{} {}",
                    message.topic,
                    String::from_utf8_lossy(&message.payload)
                );
            }
            ClientEvent::Connected { session_present } => {
                info!("Connected (session present: {})", session_present);
            }
            ClientEvent::Refused(code) => {
                return Err(format!("Broker refused connection: {:?}", code).into());
            }
            ClientEvent::Disconnected { reason } => warn!("Disconnected: {}", reason),
            ClientEvent::Reconnecting { attempt, delay } => {
                info!("Reconnecting (attempt {}, after {:?})", attempt, delay);
            }
        }
    }
    Ok(())
}

fn run(config: &Config, args: Args) -> BoxResult<()> {
    let qos = match args.qos {
        Some(level) => QoS::try_from(level)?,
        None => config.mqtt.qos(),
    };

    let mut client_config = config.client_config();
    if let Some(tls) = config.tls.setup(&config.mqtt.broker)? {
        client_config = client_config.tls(tls);
    }

    let (dispatcher, _thread) = Dispatcher::spawn(config.net.dispatcher_config())?;
    let (client, events) = Client::new(client_config, dispatcher.clone())?;
    client.connect_to(config.mqtt.broker.as_str(), config.mqtt.auto_reconnect)?;
    info!("Connecting to {} as {}", config.mqtt.broker, config.mqtt.client_id);

    let result = match args.command {
        Command::Publish { topic, message } => {
            publish(&client, &events, config, &topic, message, qos, args.retain)
        }
        Command::Subscribe { topics } => subscribe(&client, &events, &topics, qos),
    };

    drop(client);
    dispatcher.shutdown()?;
    result
}

fn main() {
    // Parse CLI args first (only for config path and help)
    let args = parse_args();

    // Load configuration from file + environment variables
    let config = match Config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logger with configured level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();

    if let Err(e) = run(&config, args) {
        error!("{}", e);
        std::process::exit(1);
    }
}
