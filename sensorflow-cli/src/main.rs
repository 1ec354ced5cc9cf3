use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use sensorflow_cli::driver::{self, DriverError};
use sensorflow_core::config::{flags, RawArgs};
use tracing_subscriber::EnvFilter;

/// Every job flag is optional here; the resolver decides what is required.
#[derive(Parser, Debug)]
#[command(name = "sensorflow")]
#[command(about = "Exactly-once sensor moments pipeline", long_about = None)]
struct JobArgs {
    /// Broker address, e.g. memory://local
    #[arg(long, env = "SENSORFLOW_BOOTSTRAP_SERVER")]
    bootstrap_server: Option<String>,
    /// `memory` or `durable`
    #[arg(long)]
    state_backend: Option<String>,
    /// Memory backend capacity in MB [default: 20]
    #[arg(long)]
    state_backend_mbsize: Option<String>,
    /// Checkpoint interval in minutes [default: 10]
    #[arg(long)]
    flink_checkpoints_interval: Option<String>,
    /// Checkpoint directory, required with `--state-backend durable`
    #[arg(long)]
    flink_checkpoints_dir: Option<String>,
    #[arg(long)]
    input_topic: Option<String>,
    #[arg(long)]
    output_topic: Option<String>,
    /// Consumer group and transactional id prefix
    #[arg(long)]
    job_name: Option<String>,
    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl JobArgs {
    fn raw_args(&self) -> RawArgs {
        let mut raw = RawArgs::new();
        raw.set_opt(flags::BOOTSTRAP_SERVER, self.bootstrap_server.as_deref())
            .set_opt(flags::STATE_BACKEND, self.state_backend.as_deref())
            .set_opt(flags::STATE_BACKEND_MBSIZE, self.state_backend_mbsize.as_deref())
            .set_opt(flags::CHECKPOINTS_INTERVAL, self.flink_checkpoints_interval.as_deref())
            .set_opt(flags::CHECKPOINTS_DIR, self.flink_checkpoints_dir.as_deref())
            .set_opt(flags::INPUT_TOPIC, self.input_topic.as_deref())
            .set_opt(flags::OUTPUT_TOPIC, self.output_topic.as_deref())
            .set_opt(flags::JOB_NAME, self.job_name.as_deref());
        raw
    }
}

fn main() -> ExitCode {
    let args = JobArgs::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match driver::run(&args.raw_args()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(DriverError::Config(err)) => {
            eprintln!("error: {err}\n");
            eprintln!("{}", JobArgs::command().render_help());
            ExitCode::from(2)
        }
        Err(DriverError::Pipeline(err)) => {
            tracing::error!("{err:?}");
            ExitCode::from(1)
        }
    }
}
