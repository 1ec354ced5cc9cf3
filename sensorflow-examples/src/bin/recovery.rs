use std::sync::Arc;

use anyhow::{bail, Result};
use sensorflow_api::environment::StreamExecutionEnvironment;
use sensorflow_core::config::CheckpointPolicy;
use sensorflow_core::connector::{
    BincodeSchema, BrokerSink, BrokerSource, DeliveryGuarantee, MemoryBroker, OutgoingMessage,
    SerializationSchema,
};
use sensorflow_core::graph::PipelineGraph;
use sensorflow_core::runtime::Transform;
use sensorflow_core::state::DurableStateBackend;

/// Running sum; fails once on `crash_at` to simulate a process crash.
struct RunningSum {
    sum: u64,
    crash_at: Option<u64>,
}

impl Transform<u64, u64> for RunningSum {
    fn process(&mut self, input: u64, output: &mut Vec<u64>) -> Result<()> {
        if self.crash_at == Some(input) {
            bail!("simulated crash at input {input}");
        }
        self.sum += input;
        output.push(self.sum);
        Ok(())
    }

    fn snapshot_state(&self) -> Result<Vec<u8>> {
        Ok(self.sum.to_le_bytes().to_vec())
    }

    fn restore_state(&mut self, data: &[u8]) -> Result<()> {
        let bytes: [u8; 8] = data.try_into()?;
        self.sum = u64::from_le_bytes(bytes);
        Ok(())
    }
}

fn graph(
    env: &StreamExecutionEnvironment,
    broker: &MemoryBroker,
    crash_at: Option<u64>,
) -> Result<PipelineGraph<u64, u64>> {
    let source = BrokerSource::subscribe(broker, "numbers", "sums", BincodeSchema::<u64>::new())?;
    let sink = BrokerSink::new(
        Arc::new(broker.clone()),
        "sums",
        BincodeSchema::<u64>::new(),
        DeliveryGuarantee::ExactlyOnce,
    )?
    .with_transactional_prefix("sums");
    Ok(env
        .add_source(source)
        .process(RunningSum { sum: 0, crash_at })
        .sink_to(sink))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let checkpoint_dir = std::env::temp_dir().join(format!("sensorflow-recovery-{}", std::process::id()));
    let broker = MemoryBroker::named("recovery")?;
    let schema = BincodeSchema::<u64>::new();
    let publish = |range: std::ops::RangeInclusive<u64>| -> Result<()> {
        for n in range {
            broker.publish("numbers", OutgoingMessage::new(schema.serialize(&n)?))?;
        }
        Ok(())
    };

    // First run: checkpoint after 1..=5, then crash on 8.
    publish(1..=5)?;
    let env = StreamExecutionEnvironment::new("sums");
    env.set_state_backend(Arc::new(DurableStateBackend::new(&checkpoint_dir)?));
    env.enable_checkpointing(CheckpointPolicy::every_minutes(10)?);
    let handle = env.launch(graph(&env, &broker, Some(8))?)?;
    while handle.records_written() < 5 {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    let checkpoint = handle.trigger_checkpoint()?;
    handle.wait_for_checkpoint(checkpoint, std::time::Duration::from_secs(10));
    publish(6..=10)?;
    broker.close_topic("numbers")?;
    if let Err(err) = handle.join() {
        println!("first run failed: {err}");
    }

    // Second run: same directory, no crash.
    let env = StreamExecutionEnvironment::new("sums");
    env.set_state_backend(Arc::new(DurableStateBackend::new(&checkpoint_dir)?));
    env.enable_checkpointing(CheckpointPolicy::every_minutes(10)?);
    let outcome = env.execute(graph(&env, &broker, None)?)?;
    println!(
        "restored from checkpoint {:?}, replayed {} records",
        outcome.restored_from, outcome.records_read
    );

    let sums: Vec<u64> = broker
        .read_committed("sums")?
        .iter()
        .map(|m| bincode::deserialize(&m.payload))
        .collect::<Result<_, _>>()?;
    println!("committed sums: {sums:?}");

    std::fs::remove_dir_all(&checkpoint_dir)?;
    Ok(())
}
