use std::fs;
use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Per-event trace encoding in the VM worker is chatty at debug level.
pub const DEFAULT_NOISE_FILTER: &str = "seqflow_core::vm::trace=warn,seqflow_core::vm::value_codec=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "seqflow";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

/// Targets the file sink keeps at debug even when the console quiets them.
const FILE_DEBUG_TARGETS: [&str; 1] = ["seqflow_core::vm::trace"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

/// Filter directives for the console and file layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    /// Console-only logging, with the reason the file sink is unavailable.
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Daily-rolling appender under `<data_dir>/logs`.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention_files = match options.retention_files {
        0 => DEFAULT_LOG_RETENTION_FILES,
        files => files,
    };
    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);
    match built {
        Ok(appender) => FileSinkPlan::Ready { log_dir, appender },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the
/// default. The noise filter is merged only when neither `--log-filter` nor
/// `-v` was given.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = match (options.cli_log_filter.as_deref(), options.verbose) {
        (Some(filter), _) => filter.to_string(),
        (None, 2..) => "trace".to_string(),
        (None, 1) => "debug".to_string(),
        (None, 0) => options
            .rust_log_env
            .clone()
            .unwrap_or_else(|| options.default_log_filter.clone()),
    };

    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;
    let noise = options.noise_filter.trim();
    if !implicit || noise.is_empty() {
        return LoggingFilterPlan {
            console_filter: user_filter.clone(),
            file_filter: user_filter.clone(),
            user_filter,
        };
    }

    let file_noise = noise
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .map(|directive| match directive.split_once('=') {
            Some((target, _)) if FILE_DEBUG_TARGETS.contains(&target.trim()) => {
                format!("{}=debug", target.trim())
            }
            _ => directive.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",");

    LoggingFilterPlan {
        console_filter: format!("{noise},{user_filter}"),
        file_filter: format!("{file_noise},{user_filter}"),
        user_filter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn cli_log_filter_overrides_everything() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("seqflow_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "seqflow_core=trace");
        assert_eq!(filters.console_filter, "seqflow_core=trace");
        assert_eq!(filters.file_filter, "seqflow_core=trace");
    }

    #[test]
    fn verbose_levels_beat_rust_log() {
        let debug = LoggingInitOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let trace = LoggingInitOptions {
            verbose: 2,
            ..debug.clone()
        };

        assert_eq!(compose_logging_filters(&debug).console_filter, "debug");
        assert_eq!(compose_logging_filters(&trace).console_filter, "trace");
    }

    #[test]
    fn noise_filter_included_for_implicit_filter_selection() {
        let options = LoggingInitOptions {
            rust_log_env: Some("info".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "info");
        assert_eq!(
            filters.console_filter,
            format!("{DEFAULT_NOISE_FILTER},info")
        );
        assert_eq!(
            filters.file_filter,
            "seqflow_core::vm::trace=debug,seqflow_core::vm::value_codec=warn,info"
        );
    }

    #[test]
    fn default_filter_used_when_nothing_else_given() {
        let options = LoggingInitOptions {
            noise_filter: String::new(),
            ..Default::default()
        };
        let filters = compose_logging_filters(&options);
        assert_eq!(filters.console_filter, DEFAULT_LOG_FILTER);
        assert_eq!(filters.file_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn file_sink_uses_default_log_dir_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");
        let options = LoggingInitOptions {
            data_dir: Some(data_dir.path().to_path_buf()),
            retention_files: 0,
            ..Default::default()
        };

        match build_file_sink_plan(&options) {
            FileSinkPlan::Ready { log_dir, .. } => {
                assert_eq!(log_dir, data_dir.path().join(DEFAULT_LOG_DIR_NAME));
                assert!(log_dir.exists());
            }
            FileSinkPlan::Fallback { reason, .. } => panic!("unexpected fallback: {reason}"),
        }
    }

    #[test]
    fn file_sink_falls_back_without_data_dir() {
        match build_file_sink_plan(&LoggingInitOptions::default()) {
            FileSinkPlan::Fallback {
                attempted_log_dir,
                reason,
            } => {
                assert!(attempted_log_dir.is_none());
                assert!(reason.contains("data_dir is not configured"));
            }
            FileSinkPlan::Ready { .. } => panic!("expected fallback without data dir"),
        }
    }

    #[test]
    fn file_sink_falls_back_when_log_dir_cannot_be_created() {
        let blocker = NamedTempFile::new().expect("temp file");
        let plan = build_file_sink_plan(&LoggingInitOptions {
            data_dir: Some(blocker.path().to_path_buf()),
            ..Default::default()
        });
        assert!(matches!(
            plan,
            FileSinkPlan::Fallback { ref reason, .. } if reason.contains("failed to create log directory")
        ));
    }
}
