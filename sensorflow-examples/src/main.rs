use std::sync::Arc;
use std::time::Duration;

use sensorflow_api::environment::StreamExecutionEnvironment;
use sensorflow_core::config::CheckpointPolicy;
use sensorflow_core::connector::{
    BrokerSink, BrokerSource, DeliveryGuarantee, JsonSchema, MemoryBroker, OutgoingMessage,
};
use sensorflow_core::time::BoundedOutOfOrderness;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Celsius {
    sensor: String,
    ts: i64,
    degrees: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Fahrenheit {
    sensor: String,
    degrees: f64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("warn").init();

    let broker = MemoryBroker::named("local")?;
    for (sensor, ts, degrees) in [("kitchen", 1_000, 21.5), ("garage", 2_000, 4.0), ("kitchen", 3_000, 22.0)] {
        let payload = serde_json::to_vec(&Celsius {
            sensor: sensor.to_string(),
            ts,
            degrees,
        })?;
        broker.publish("celsius", OutgoingMessage::new(payload))?;
    }
    broker.close_topic("celsius")?;

    let env = StreamExecutionEnvironment::new("to-fahrenheit");
    env.enable_checkpointing(CheckpointPolicy::every_minutes(1)?);

    let source = BrokerSource::subscribe(&broker, "celsius", "to-fahrenheit", JsonSchema::<Celsius>::new())?
        .with_watermark_strategy(BoundedOutOfOrderness::new(
            Duration::from_secs(1),
            |c: &Celsius| c.ts,
        ));
    let sink = BrokerSink::new(
        Arc::new(broker.clone()),
        "fahrenheit",
        JsonSchema::<Fahrenheit>::new(),
        DeliveryGuarantee::ExactlyOnce,
    )?;

    let graph = env
        .add_source(source)
        .map(|c: Celsius| {
            Ok(Fahrenheit {
                sensor: c.sensor,
                degrees: c.degrees * 9.0 / 5.0 + 32.0,
            })
        })
        .sink_to(sink);
    let outcome = env.execute(graph)?;

    // Committed output only becomes visible once the final checkpoint completes.
    for message in broker.read_committed("fahrenheit")? {
        let reading: Fahrenheit = serde_json::from_slice(&message.payload)?;
        println!(
            "ts={} sensor={} degrees={:.1}",
            message.timestamp.unwrap_or(-1),
            reading.sensor,
            reading.degrees
        );
    }
    println!("checkpoints: {:?}", outcome.completed_checkpoints);

    Ok(())
}
