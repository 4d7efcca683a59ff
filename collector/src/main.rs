use std::{error::Error, time::Duration};

use decay_core::topics::{parse_telemetry_topic, TELEMETRY_TOPIC};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Publish, QoS};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};

use crate::receiver::UploadReceiver;

mod receiver;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None | Some("serve") => serve().await,
        Some("trigger") => {
            let addr = args
                .next()
                .ok_or("usage: decay-collector trigger <node-address>")?;
            trigger(&addr).await
        }
        Some("listen") => listen().await,
        Some(other) => {
            Err(format!("unknown mode '{other}', expected serve, trigger or listen").into())
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Accepts uploads one connection at a time.
async fn serve() -> Result<(), Box<dyn Error>> {
    let listen = env_or("COLLECTOR_LISTEN", "0.0.0.0:5000");
    let mut receiver = UploadReceiver::new(
        env_or("COLLECTOR_DIR", "uploads"),
        env_or("COLLECTOR_PATH", "/upload"),
        IO_TIMEOUT,
    )?;

    let listener = TcpListener::bind(&listen).await?;
    log::info!("Waiting for uploads on {listen}...");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("Could not accept a connection: {e}");
                continue;
            }
        };
        if let Err(e) = receiver.handle(stream).await {
            log::warn!("Upload from {peer} rejected: {e}");
        }
    }
}

/// Asks a node for a capture and prints its answer.
async fn trigger(addr: &str) -> Result<(), Box<dyn Error>> {
    log::info!("Requesting a capture from {addr}...");
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(b"GET_DATA\r\n").await?;

    let mut reply = String::new();
    timeout(IO_TIMEOUT, stream.read_to_string(&mut reply)).await??;
    println!("{reply}");

    Ok(())
}

/// Logs every voltage published by any node.
async fn listen() -> Result<(), Box<dyn Error>> {
    let mqtt_address = std::env::var("MQTT")
        .map_err(|_| "Environment variable `MQTT` is required with a host url to an MQTT broker")?;

    log::info!("Connecting to the MQTT server at '{}'...", mqtt_address);

    let mut mqttoptions = MqttOptions::parse_url(mqtt_address)?;
    mqttoptions.set_keep_alive(Duration::from_secs(5));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 16);
    client.subscribe(TELEMETRY_TOPIC, QoS::AtMostOnce).await?;

    log::info!("Waiting for messages...");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(message))) => process_message(&message),
            Ok(x) => {
                log::trace!("{x:?}");
            }
            Err(e) => {
                log::error!("Mqtt connection error: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        };
    }
}

fn process_message(message: &Publish) {
    let Some(node_id) = parse_telemetry_topic(&message.topic) else {
        return;
    };
    match std::str::from_utf8(&message.payload) {
        Ok(voltage) => log::info!("{node_id}: {voltage} V"),
        Err(e) => log::error!("Unreadable payload from {node_id}: {e}"),
    }
}
