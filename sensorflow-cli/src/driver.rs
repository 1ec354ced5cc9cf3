use std::sync::Arc;
use std::time::Duration;

use sensorflow_api::environment::StreamExecutionEnvironment;
use sensorflow_core::config::{ConfigError, JobConfiguration, RawArgs};
use sensorflow_core::connector::{
    self, BrokerClient, BrokerSink, BrokerSource, DeliveryGuarantee, JsonSchema, KeyedSchema,
};
use sensorflow_core::error::PipelineError;
use sensorflow_core::graph::PipelineGraph;
use sensorflow_core::runtime::JobOutcome;
use sensorflow_core::time::BoundedOutOfOrderness;
use thiserror::Error;

use crate::moments::{MomentsAggregate, RunningMoments, SensorReading};

/// How far behind the newest reading a sensor may report.
pub const MAX_OUT_OF_ORDERNESS: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Resolve `raw`, build the moments pipeline and run it to the end.
pub fn run(raw: &RawArgs) -> Result<JobOutcome, DriverError> {
    let config = JobConfiguration::resolve(raw).map_err(|err| {
        tracing::error!("invalid configuration: {err}");
        err
    })?;
    tracing::info!(
        job = %config.job_name,
        broker = %config.bootstrap_server,
        backend = config.state_backend.kind(),
        checkpoint_interval_min = config.checkpoint_interval_minutes(),
        "configuration resolved"
    );
    Ok(execute(&config)?)
}

/// Run the moments pipeline described by `config`.
pub fn execute(config: &JobConfiguration) -> Result<JobOutcome, PipelineError> {
    let env = StreamExecutionEnvironment::from_config(config).map_err(|err| {
        tracing::error!(backend = config.state_backend.kind(), "{err}");
        err
    })?;
    let client = connector::connect(&config.bootstrap_server)?;
    let graph = build_graph(&env, config, client).map_err(|err| {
        tracing::error!("failed to build pipeline: {err}");
        err
    })?;

    let outcome = env.execute(graph).map_err(|err| {
        tracing::error!(job = %config.job_name, "job failed: {err}");
        err
    })?;
    tracing::info!(
        job = %outcome.job_name,
        records_read = outcome.records_read,
        records_written = outcome.records_written,
        checkpoints = outcome.completed_checkpoints.len(),
        "job finished"
    );
    Ok(outcome)
}

/// Input topic → [`RunningMoments`] → output topic, exactly once.
///
/// The job name doubles as consumer group and transactional prefix, so a
/// restarted job finds its own offsets and open transactions.
pub fn build_graph(
    env: &StreamExecutionEnvironment,
    config: &JobConfiguration,
    client: Arc<dyn BrokerClient>,
) -> Result<PipelineGraph<SensorReading, MomentsAggregate>, PipelineError> {
    let source = BrokerSource::subscribe(
        client.as_ref(),
        &config.input_topic,
        &config.job_name,
        JsonSchema::<SensorReading>::new().skip_malformed(),
    )
    .map_err(PipelineError::RuntimeStartup)?
    .with_watermark_strategy(BoundedOutOfOrderness::new(
        MAX_OUT_OF_ORDERNESS,
        |reading: &SensorReading| reading.timestamp,
    ));

    let sink = BrokerSink::new(
        client,
        &config.output_topic,
        KeyedSchema::new(JsonSchema::<MomentsAggregate>::new(), |aggregate: &MomentsAggregate| {
            aggregate.sensor_id.as_bytes().to_vec()
        }),
        DeliveryGuarantee::ExactlyOnce,
    )?
    .with_transactional_prefix(config.job_name.clone());

    Ok(env
        .add_source(source)
        .process(RunningMoments::new())
        .sink_to(sink))
}

#[cfg(test)]
#[path = "tests/driver_tests.rs"]
mod tests;
