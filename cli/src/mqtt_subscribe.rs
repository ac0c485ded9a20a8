//! # `mqtt_subscribe`: Topic Tap for Debugging
//!
//! Connects to a broker, subscribes to one topic filter and prints every message
//! that arrives as `[<topic>] <payload>`. Handy for checking what the sensor nodes
//! actually publish before blaming the relay.
//!
//! ## Usage
//!
//! ```text
//! mqtt_subscribe --broker <broker> --topic <topic> [OPTIONS]
//!
//! OPTIONS:
//! -b, --broker <broker>          Broker host (required)
//! -p, --port <port>              Broker port [default: 1883]
//! -t, --topic <topic>            Topic filter (required)
//!     --client-id <client-id>    MQTT client id [default: mqtt-subscriber]
//! ```
//!
//! Exits with status 1 when the broker refuses the connection or the connection
//! fails; Ctrl-C exits cleanly.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use clap::Parser;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet, QoS};
use std::process::ExitCode;
use std::time::Duration;

/// Command-line arguments of the topic tap.
#[derive(Parser, Debug)]
#[command(name = "mqtt_subscribe", about = "Print every message published on an MQTT topic", version)]
struct Args {
    /// Broker host.
    #[arg(short, long)]
    broker: String,

    /// Broker port.
    #[arg(short, long, default_value_t = 1883)]
    port: u16,

    /// Topic filter to subscribe to (wildcards allowed).
    #[arg(short, long)]
    topic: String,

    /// MQTT client id.
    #[arg(long, default_value = "mqtt-subscriber")]
    client_id: String,
}

fn format_message(topic: &str, payload: &[u8]) -> String {
    format!("[{}] {}", topic, String::from_utf8_lossy(payload))
}

fn describe_error(error: &ConnectionError) -> String {
    match error {
        ConnectionError::ConnectionRefused(code) => {
            format!("[-] Failed to connect, return code {:?}", code)
        }
        other => format!("[-] Connection error: {}", other),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut options = MqttOptions::new(args.client_id.clone(), args.broker.clone(), args.port);
    options.set_keep_alive(Duration::from_secs(60));
    let (client, mut eventloop) = AsyncClient::new(options, 16);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n[!] Interrupted by user");
                let _ = client.try_disconnect();
                return ExitCode::SUCCESS;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        println!("[-] Failed to connect, return code {:?}", ack.code);
                        return ExitCode::FAILURE;
                    }
                    println!("[+] Connected to {}:{}", args.broker, args.port);
                    // Clean sessions forget subscriptions, so subscribe on every ConnAck.
                    if let Err(e) = client.try_subscribe(args.topic.as_str(), QoS::AtMostOnce) {
                        println!("[-] Subscribe failed: {}", e);
                        return ExitCode::FAILURE;
                    }
                    println!("[+] Subscribed to topic: {}", args.topic);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    println!("{}", format_message(&publish.topic, &publish.payload));
                }
                Ok(_) => {}
                Err(e) => {
                    println!("{}", describe_error(&e));
                    return ExitCode::FAILURE;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_and_topic_are_required() {
        assert!(Args::try_parse_from(["mqtt_subscribe", "--topic", "a/b"]).is_err());
        assert!(Args::try_parse_from(["mqtt_subscribe", "--broker", "localhost"]).is_err());

        let args = Args::try_parse_from(["mqtt_subscribe", "-b", "localhost", "-t", "a/#"]).unwrap();
        assert_eq!(args.port, 1883);
        assert_eq!(args.client_id, "mqtt-subscriber");
    }

    #[test]
    fn payloads_are_printed_lossily() {
        assert_eq!(
            format_message("esp32/sensors/dht11", br#"{"humidity":28}"#),
            r#"[esp32/sensors/dht11] {"humidity":28}"#
        );
        assert_eq!(format_message("t", &[0x6f, 0xff, 0x6b]), "[t] o\u{fffd}k");
    }

    #[test]
    fn refused_connections_report_the_return_code() {
        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert_eq!(describe_error(&refused), "[-] Failed to connect, return code NotAuthorized");
    }
}
