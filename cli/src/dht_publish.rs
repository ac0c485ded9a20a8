//! # `dht_publish`: Simulated DHT11 Sensor Node
//!
//! Publishes DHT11-style readings to an MQTT broker so the relay can be exercised
//! without hardware. Every message is a JSON object such as
//! `{"temperature":31.1,"humidity":28}`, sent with QoS 0 on the sensor topic.
//!
//! ## Usage
//!
//! ```text
//! dht_publish [OPTIONS]
//!
//! OPTIONS:
//!     --broker <broker>                    Broker host [default: localhost]
//!     --port <port>                        Broker port [default: 1883]
//!     --topic <topic>                      Sensor topic [default: esp32/sensors/dht11]
//! -c, --count <count>                      Messages to publish [default: 5]
//! -i, --interval-ms <interval-ms>          Pause between messages [default: 1000]
//! -j, --jitter                             Randomize readings around the defaults
//!     --malformed-every <n>                Send the literal `oops` every n-th message
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_relay::{BrokerConfig, DEFAULT_TOPIC, mqtt_options};
use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde_json::json;
use std::time::Duration;

const BASE_TEMPERATURE: f64 = 31.1;
const BASE_HUMIDITY: i64 = 28;
const MALFORMED_BODY: &str = "oops";

/// Command-line arguments of the simulated sensor.
#[derive(Parser, Debug)]
#[command(name = "dht_publish", about = "Publish simulated DHT11 readings to an MQTT broker", version)]
struct Args {
    /// Broker host.
    #[arg(long, default_value = "localhost")]
    broker: String,

    /// Broker port.
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Topic to publish on.
    #[arg(long, default_value = DEFAULT_TOPIC)]
    topic: String,

    /// Number of messages to publish.
    #[arg(short, long, default_value_t = 5)]
    count: u32,

    /// Pause between messages in milliseconds.
    #[arg(short, long, default_value_t = 1000)]
    interval_ms: u64,

    /// Randomize readings around the default values.
    #[arg(short, long)]
    jitter: bool,

    /// Replace every n-th message with a body that is not JSON.
    #[arg(long, value_name = "N")]
    malformed_every: Option<u32>,
}

/// Body of the `seq`-th message (1-based).
fn message_body<R: Rng>(seq: u32, args: &Args, rng: &mut R) -> String {
    if let Some(n) = args.malformed_every {
        if n > 0 && seq % n == 0 {
            return MALFORMED_BODY.to_string();
        }
    }
    if !args.jitter {
        return json!({ "temperature": BASE_TEMPERATURE, "humidity": BASE_HUMIDITY }).to_string();
    }

    let temperature = ((BASE_TEMPERATURE + rng.random_range(-2.0..=2.0)) * 10.0).round() / 10.0;
    let humidity = BASE_HUMIDITY + rng.random_range(-5..=5);
    json!({ "temperature": temperature, "humidity": humidity }).to_string()
}

/// Polls until the broker acknowledges the connection.
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => bail!("connection failed: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = BrokerConfig {
        host: args.broker.clone(),
        port: args.port,
        topic: args.topic.clone(),
        client_id_prefix: "dht-publish".to_string(),
        ..BrokerConfig::default()
    };
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 16);

    wait_for_connack(&mut eventloop)
        .await
        .with_context(|| format!("Cannot reach broker {}:{}", args.broker, args.port))?;
    println!("[+] Connected to {}:{}", args.broker, args.port);

    // The event loop has to keep running for queued publishes to reach the socket.
    let pump = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(e) => {
                    eprintln!("[-] Connection error: {}", e);
                    break;
                }
            }
        }
    });

    let mut rng = rand::rng();
    for seq in 1..=args.count {
        let body = message_body(seq, &args, &mut rng);
        client
            .publish(&args.topic, QoS::AtMostOnce, false, body.clone().into_bytes())
            .await
            .context("Failed to queue publish")?;
        println!("[{}] {}", args.topic, body);

        if seq < args.count {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    client.disconnect().await.context("Failed to queue disconnect")?;
    pump.await.context("Event loop task failed")?;
    println!("[+] Published {} message(s)", args.count);

    Ok(())
}
