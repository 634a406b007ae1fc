//! Listens to weather station reports and prints the values they carry.
//!
//! ```text
//! MQTT_ADDRESS=weather.local:1883 cargo run --example listener --features std
//! ```

use dotenvy::dotenv;
use libmqtt::network::Connect;
use libmqtt::network::application::mqtt::{
    Client, Event, Handler, Options, Publish, QoS, Redial,
};
use libmqtt::network::tcp::{SystemClock, TcpConnector};
use serde::Deserialize;
use std::env;
use std::thread::sleep;
use std::time::Duration;

const BUFFER_SIZE: usize = 2048;

/// Fields a station report may carry; anything else is ignored.
#[derive(Debug, Default, Deserialize)]
struct Report {
    runtime: Option<f32>,
    tempin: Option<f32>,
    humidityin: Option<f32>,
    baromrel: Option<f32>,
    tf_ch1: Option<f32>,
    tf_ch2: Option<f32>,
    tf_batt1: Option<f32>,
    tf_batt2: Option<f32>,
}

/// Maps report fields to display names for one station.
struct Station {
    topic: &'static str,
    variables: &'static [(&'static str, &'static str)],
}

const STATIONS: &[Station] = &[
    Station {
        topic: "weather_branna",
        variables: &[
            ("runtime", "branna/outside/runtime"),
            ("tempin", "branna/outside/temperature"),
            ("humidityin", "branna/outside/humidity"),
            ("baromrel", "branna/outside/pressure"),
            ("tf_ch1", "branna/lake/surface/temperature"),
            ("tf_ch2", "branna/lake/subsurface/temperature"),
            ("tf_batt1", "branna/lake/surface/battery"),
            ("tf_batt2", "branna/lake/subsurface/battery"),
        ],
    },
    Station {
        topic: "weather_ulrikashus",
        variables: &[
            ("runtime", "ulrikashus/inside/runtime"),
            ("tempin", "ulrikashus/inside/temperature"),
            ("humidityin", "ulrikashus/inside/humidity"),
            ("baromrel", "ulrikashus/inside/pressure"),
        ],
    },
];

impl Report {
    fn field(&self, name: &str) -> Option<f32> {
        match name {
            "runtime" => self.runtime,
            "tempin" => self.tempin,
            "humidityin" => self.humidityin,
            "baromrel" => self.baromrel,
            "tf_ch1" => self.tf_ch1,
            "tf_ch2" => self.tf_ch2,
            "tf_batt1" => self.tf_batt1,
            "tf_batt2" => self.tf_batt2,
            _ => None,
        }
    }
}

struct Printer;

impl Handler for Printer {
    fn on_publish(&mut self, publish: &Publish<'_>) {
        println!(
            "Received: ('{}') {}",
            publish.topic,
            String::from_utf8_lossy(publish.payload)
        );
        let Some(station) = STATIONS.iter().find(|s| s.topic == publish.topic) else {
            return;
        };
        match serde_json_core::from_slice::<Report>(publish.payload) {
            Ok((report, _)) => {
                for (field, name) in station.variables {
                    if let Some(value) = report.field(field) {
                        println!(" --> {name}: {value}");
                    }
                }
            }
            Err(e) => println!("JSON parse failed: {e}"),
        }
    }

    fn on_event(&mut self, event: &Event<'_>) {
        match event {
            Event::Connected { session_present } => {
                println!("Connected (session present: {session_present})")
            }
            Event::Subscribed { packet_id, return_codes } => {
                println!("Subscribed ({packet_id}): {return_codes:?}")
            }
            _ => {}
        }
    }
}

fn main() {
    dotenv().ok();
    let address = env::var("MQTT_ADDRESS").unwrap_or("weather.local:1883".to_string());

    println!("Connecting to {address}");
    let connection = match TcpConnector.connect(&address) {
        Ok(connection) => connection,
        Err(e) => {
            eprintln!("error: failed to open socket: {e}");
            std::process::exit(1);
        }
    };

    let mut redial = Redial::new(TcpConnector, &address);
    let mut send_buf = [0u8; BUFFER_SIZE];
    let mut recv_buf = [0u8; BUFFER_SIZE];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Printer, SystemClock)
        .with_reconnect(&mut redial);

    let options = Options {
        keep_alive_seconds: 400,
        ..Options::new("")
    };
    let topics: Vec<(&str, QoS)> = STATIONS
        .iter()
        .map(|station| (station.topic, QoS::AtMostOnce))
        .collect();
    for station in STATIONS {
        println!("Subscribing to {}", station.topic);
    }
    if let Err(e) = client.connect(options) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
    if let Err(e) = client.subscribe(&topics) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    println!("Listening for messages, press Ctrl-C to exit\n");
    loop {
        if let Err(e) = client.sync() {
            eprintln!("error: {e}");
        }
        sleep(Duration::from_millis(100));
    }
}
