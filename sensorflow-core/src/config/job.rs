use super::*;

/// State backend choice, decided once at resolution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateBackendChoice {
    /// Snapshots kept in process memory, bounded by `max_state_size_mb`.
    Memory { max_state_size_mb: u64 },
    /// Snapshots persisted under `checkpoint_dir`.
    Durable { checkpoint_dir: PathBuf },
}

impl StateBackendChoice {
    pub fn kind(&self) -> &'static str {
        match self {
            StateBackendChoice::Memory { .. } => "memory",
            StateBackendChoice::Durable { .. } => "durable",
        }
    }

    /// In-memory snapshot capacity in bytes, if this is the memory backend.
    pub fn memory_capacity_bytes(&self) -> Option<usize> {
        match self {
            StateBackendChoice::Memory { max_state_size_mb } => {
                Some((*max_state_size_mb as usize).saturating_mul(BYTES_PER_MB))
            }
            StateBackendChoice::Durable { .. } => None,
        }
    }
}

/// Immutable job configuration, passed explicitly to every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfiguration {
    pub job_name: String,
    pub bootstrap_server: String,
    pub input_topic: String,
    pub output_topic: String,
    pub state_backend: StateBackendChoice,
    pub checkpoint_policy: CheckpointPolicy,
}

impl JobConfiguration {
    /// Validate and normalize raw flags.
    pub fn resolve(raw: &RawArgs) -> Result<Self, ConfigError> {
        resolve(raw)
    }

    /// Checkpoint interval in whole minutes.
    pub fn checkpoint_interval_minutes(&self) -> u64 {
        self.checkpoint_policy.interval().as_secs() / 60
    }
}

/// Resolve raw flags into a [`JobConfiguration`].
///
/// Backend kind is checked before any backend-specific field, so an
/// unsupported kind is reported as such even when other flags are missing.
pub fn resolve(raw: &RawArgs) -> Result<JobConfiguration, ConfigError> {
    let bootstrap_server = raw.require(flags::BOOTSTRAP_SERVER)?.to_string();
    let backend_kind = raw.require(flags::STATE_BACKEND)?;

    let state_backend = match backend_kind {
        "memory" => StateBackendChoice::Memory {
            max_state_size_mb: raw
                .positive_u64_or(flags::STATE_BACKEND_MBSIZE, DEFAULT_STATE_BACKEND_MB)?,
        },
        "durable" => StateBackendChoice::Durable {
            checkpoint_dir: PathBuf::from(raw.require(flags::CHECKPOINTS_DIR)?),
        },
        other => return Err(ConfigError::UnsupportedBackendKind(other.to_string())),
    };

    let interval_minutes = raw.positive_u64_or(
        flags::CHECKPOINTS_INTERVAL,
        DEFAULT_CHECKPOINT_INTERVAL_MINUTES,
    )?;
    let checkpoint_policy = CheckpointPolicy::every_minutes(interval_minutes)?;

    Ok(JobConfiguration {
        job_name: raw.get(flags::JOB_NAME).unwrap_or(DEFAULT_JOB_NAME).to_string(),
        bootstrap_server,
        input_topic: raw
            .get(flags::INPUT_TOPIC)
            .unwrap_or(DEFAULT_INPUT_TOPIC)
            .to_string(),
        output_topic: raw
            .get(flags::OUTPUT_TOPIC)
            .unwrap_or(DEFAULT_OUTPUT_TOPIC)
            .to_string(),
        state_backend,
        checkpoint_policy,
    })
}
