use std::path::PathBuf;
use std::time::Duration;

/// Log output format, selected by `LOG_FORMAT`.
///
/// Read on its own, ahead of [`WorkerConfig`], so configuration errors are
/// already logged in the chosen format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines (default).
    Text,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// `json` (any case) selects JSON; anything else falls back to text.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} is invalid: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Backend project URL, used for both REST and realtime.
    pub supabase_url: String,
    pub anon_key: String,
    /// Signed-in doorman's access token. Without it requests run as anon.
    pub access_token: Option<String>,
    /// Building whose decisions are watched.
    pub building_id: String,
    pub poll_interval: Duration,
    /// Directory holding the persisted signature cache.
    pub cache_dir: PathBuf,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                 | Default       |
    /// |-------------------------|---------------|
    /// | `SUPABASE_URL`          | required      |
    /// | `SUPABASE_ANON_KEY`     | required      |
    /// | `SUPABASE_ACCESS_TOKEN` | unset         |
    /// | `BUILDING_ID`           | required      |
    /// | `POLL_INTERVAL_SECS`    | `10`          |
    /// | `CACHE_DIR`             | `.porteiro`   |
    ///
    /// `LOG_FORMAT` is read separately by [`LogFormat::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let supabase_url = required("SUPABASE_URL")?;
        if !supabase_url.starts_with("http://") && !supabase_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                var: "SUPABASE_URL",
                message: format!("expected an http(s) URL, got '{supabase_url}'"),
            });
        }

        let poll_interval_secs: u64 = match get("POLL_INTERVAL_SECS") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "POLL_INTERVAL_SECS",
                message: format!("'{raw}' is not a whole number of seconds"),
            })?,
            None => 10,
        };
        if poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "POLL_INTERVAL_SECS",
                message: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            supabase_url: supabase_url.trim_end_matches('/').to_string(),
            anon_key: required("SUPABASE_ANON_KEY")?,
            access_token: get("SUPABASE_ACCESS_TOKEN"),
            building_id: required("BUILDING_ID")?,
            poll_interval: Duration::from_secs(poll_interval_secs),
            cache_dir: get("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".porteiro")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("SUPABASE_URL", "https://demo.supabase.co/"),
        ("SUPABASE_ANON_KEY", "anon"),
        ("BUILDING_ID", "b1"),
    ];

    #[test]
    fn defaults_apply_when_optional_vars_are_unset() {
        let config = load(&REQUIRED).unwrap();
        assert_eq!(config.supabase_url, "https://demo.supabase.co");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.cache_dir, PathBuf::from(".porteiro"));
        assert!(config.access_token.is_none());
    }

    #[test]
    fn optional_vars_override_defaults() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("SUPABASE_ACCESS_TOKEN", "jwt"),
            ("POLL_INTERVAL_SECS", "3"),
            ("CACHE_DIR", "/var/lib/porteiro"),
        ]);
        let config = load(&vars).unwrap();
        assert_eq!(config.access_token.as_deref(), Some("jwt"));
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.cache_dir, PathBuf::from("/var/lib/porteiro"));
    }

    #[test]
    fn log_format_defaults_to_text() {
        assert_eq!(LogFormat::parse(None), LogFormat::Text);
        assert_eq!(LogFormat::parse(Some(" JSON ")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("pretty")), LogFormat::Text);
    }

    #[test]
    fn missing_required_var_is_reported() {
        assert_matches!(
            load(&REQUIRED[..2]),
            Err(ConfigError::Missing("BUILDING_ID"))
        );
        // Blank counts as missing.
        let mut vars = REQUIRED.to_vec();
        vars[1] = ("SUPABASE_ANON_KEY", "  ");
        assert_matches!(load(&vars), Err(ConfigError::Missing("SUPABASE_ANON_KEY")));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("POLL_INTERVAL_SECS", "soon"));
        assert_matches!(
            load(&vars),
            Err(ConfigError::Invalid { var: "POLL_INTERVAL_SECS", .. })
        );

        let mut vars = REQUIRED.to_vec();
        vars.push(("POLL_INTERVAL_SECS", "0"));
        assert_matches!(load(&vars), Err(ConfigError::Invalid { .. }));

        let mut vars = REQUIRED.to_vec();
        vars[0] = ("SUPABASE_URL", "demo.supabase.co");
        assert_matches!(
            load(&vars),
            Err(ConfigError::Invalid { var: "SUPABASE_URL", .. })
        );
    }
}
