use super::*;

/// Flat mapping of flag names (without leading dashes) to raw string values.
///
/// Empty values are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawArgs {
    values: BTreeMap<String, String>,
}

impl RawArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a flag value, ignoring empty strings.
    pub fn set(&mut self, flag: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        if !value.trim().is_empty() {
            self.values.insert(flag.into(), value.trim().to_string());
        }
        self
    }

    /// Set a flag value when present.
    pub fn set_opt(&mut self, flag: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.set(flag, value);
        }
        self
    }

    pub fn get(&self, flag: &str) -> Option<&str> {
        self.values.get(flag).map(String::as_str)
    }

    pub(crate) fn require(&self, flag: &str) -> Result<&str, ConfigError> {
        self.get(flag)
            .ok_or_else(|| ConfigError::MissingRequiredField(flag.to_string()))
    }

    /// Parse a positive integer flag, falling back to `default` when absent.
    pub(crate) fn positive_u64_or(&self, flag: &str, default: u64) -> Result<u64, ConfigError> {
        let Some(raw) = self.get(flag) else {
            return Ok(default);
        };
        let parsed: u64 = raw.parse().map_err(|_| ConfigError::MalformedValue {
            field: flag.to_string(),
            value: raw.to_string(),
            reason: "expected a positive integer".to_string(),
        })?;
        if parsed == 0 {
            return Err(ConfigError::MalformedValue {
                field: flag.to_string(),
                value: raw.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(parsed)
    }
}

impl<K, V> FromIterator<(K, V)> for RawArgs
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = RawArgs::new();
        for (k, v) in iter {
            args.set(k, v);
        }
        args
    }
}
