use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt::time, layer::SubscriberExt, util::SubscriberInitExt};

/// 初始化日志/追踪（tracing）订阅者。
///
/// - 默认会读取环境变量（由 `tracing_subscriber::EnvFilter` 支持），用于覆盖/追加过滤规则。
/// - Debug 构建下调度器日志为 `debug`；Release 构建下为 `info`。
///
/// 注意：该函数应在宿主启动早期调用一次；重复初始化会返回错误。
pub fn init() -> anyhow::Result<()> {
    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_timer(time::uptime()),
        )
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?
                .add_directive(core_directive().parse()?),
        )
        .try_init()?;
    Ok(())
}

/// 库只为自身设置默认级别；宿主的 target 由 `RUST_LOG` 控制。
fn core_directive() -> &'static str {
    if cfg!(debug_assertions) {
        "tickwork-core=debug"
    } else {
        "tickwork-core=info"
    }
}
