//! 日志初始化
//!
//! `RUST_LOG` 优先于配置文件中的日志级别；`NOTIFY_LOG_FORMAT=json`
//! 或配置 `logging.json = true` 时输出结构化 JSON 日志。

use std::env;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// 从配置初始化日志系统
///
/// 重复调用是安全的：全局 subscriber 已存在时直接忽略。
pub fn init_logging(logging_config: Option<&LoggingConfig>) {
    let default_config = LoggingConfig::default();
    let config = logging_config.unwrap_or(&default_config);

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(config.level.as_str()),
    };

    let json = config.json
        || env::var("NOTIFY_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

    let builder = fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "global tracing subscriber already installed");
    }
}

/// 在正式日志初始化之前执行 `f`（如加载配置），期间的日志输出到 stderr
pub fn with_bootstrap_logging<T>(f: impl FnOnce() -> T) -> T {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    with_log_writer(std::io::stderr, env_filter, f)
}

pub(crate) fn with_log_writer<W, T>(writer: W, env_filter: EnvFilter, f: impl FnOnce() -> T) -> T
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(writer)
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}
