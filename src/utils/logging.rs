/// 日志工具模块
///
/// 提供日志初始化和格式化输出的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::models::job::Job;
use crate::models::phase::PhaseTarget;

/// 初始化全局日志
///
/// `RUST_LOG` 存在时优先使用，否则使用配置里的过滤规则；
/// `verbose` 打开后额外输出文件位置和线程名。
pub fn init(filter: &str, verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // 重复初始化（例如测试里多次调用）时忽略错误
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(verbose)
        .with_file(verbose)
        .with_line_number(verbose)
        .with_thread_names(verbose)
        .try_init();
}

/// 记录任务启动信息
pub fn log_startup(job_id: &str, target: &PhaseTarget, max_concurrent: usize) {
    info!("{}", "=".repeat(60));
    info!("🚀 任务启动: {}", job_id);
    info!("🎯 运行目标: {}", target);
    info!("📊 最大并发数: {}", max_concurrent);
    info!("{}", "=".repeat(60));
}

/// 记录知识点加载信息
pub fn log_units_loaded(total: usize, max_concurrent: usize) {
    info!("✓ 本次待处理 {} 个知识点", total);
    info!("📋 将以每批 {} 个的方式处理", max_concurrent);
}

/// 记录批次开始信息
///
/// # 参数
/// - `wave_num`: 批次编号
/// - `total_waves`: 批次总数
/// - `start`: 起始编号
/// - `end`: 结束编号
/// - `total`: 知识点总数
pub fn log_wave_start(wave_num: usize, total_waves: usize, start: usize, end: usize, total: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始处理第 {}/{} 批", wave_num, total_waves);
    info!("📄 本批知识点: {}-{} / 共 {} 个", start, end, total);
    info!("{}", "=".repeat(60));
}

pub fn log_wave_complete(wave_num: usize, success: usize, total: usize) {
    info!("\n{}", "─".repeat(60));
    info!("✓ 第 {} 批完成: 成功 {}/{}", wave_num, success, total);
    info!("{}", "─".repeat(60));
}

/// 打印任务最终统计
pub fn print_final_stats(job: &Job) {
    info!("\n{}", "=".repeat(60));
    info!("📊 任务 {} 结束: {}", job.job_id, job.status);
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", job.progress.completed, job.progress.total);
    info!("❌ 失败: {}", job.progress.failed);
    info!("⏸ 未处理: {}", job.progress.remaining);
    for item in &job.failed_items {
        info!(
            "   - {} [阶段 {}] {}{}",
            item.id,
            item.phase.map_or("-".to_string(), |p| p.to_string()),
            truncate_text(&item.error, 120),
            if item.retryable { "（续跑会重试）" } else { "" }
        );
    }
    info!("{}", "=".repeat(60));
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
