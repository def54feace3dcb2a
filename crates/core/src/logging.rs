use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ObservabilityConfig};

/// 初始化结构化日志
///
/// `RUST_LOG` 存在时优先于配置中的级别。重复初始化返回错误而不是panic，
/// 测试中可以安全地多次调用。
pub fn init_logging(config: &ObservabilityConfig) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_file(config.include_location)
                .with_line_number(config.include_location);

            registry
                .with(fmt_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("初始化日志失败: {e}"))?;
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location);

            registry
                .with(fmt_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("初始化日志失败: {e}"))?;
        }
    }

    info!(
        logging.format = ?config.log_format,
        logging.level = %config.log_level,
        "日志系统初始化完成"
    );

    Ok(())
}
