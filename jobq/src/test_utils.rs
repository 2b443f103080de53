//! # **jobq** 测试工具

pub mod memory;

use std::sync::Once;
use tracing::{Level, info};
use tracing_subscriber::fmt;

static TRACING: Once = Once::new();

/// 启用测试日志输出，多次调用只生效一次
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .try_init();
        info!("启用 {} 测试日志输出", Level::DEBUG);
    });
}
