use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use question_forge::app::{App, RunRequest};
use question_forge::config::Config;
use question_forge::models::{Job, JobStatus, PhaseTarget, ResumeMode};
use question_forge::utils::logging;

/// 知识点出题流水线
#[derive(Debug, Parser)]
#[command(name = "question_forge", version, about)]
struct Cli {
    /// 配置文件（TOML），环境变量会覆盖其中的值
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 新建任务并运行
    Run {
        /// all / through:<phase> / only:<phase> / <phase>
        #[arg(long, default_value = "all", value_parser = parse_target)]
        target: PhaseTarget,
        /// 只处理指定的知识点（可重复），默认处理目录下全部
        #[arg(long = "unit")]
        units: Vec<String>,
        /// 从已有检查点续跑
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        atoms_dir: Option<String>,
    },
    /// 查看任务状态
    Status { job_id: String },
    /// 列出全部任务
    List,
    /// 续跑失败或已取消的任务
    Resume {
        job_id: String,
        /// remaining / failed_only
        #[arg(long, default_value = "remaining", value_parser = parse_mode)]
        mode: ResumeMode,
    },
    /// 取消运行中的任务
    Cancel { job_id: String },
    /// 删除任务记录
    Delete {
        job_id: String,
        /// 同时删除各知识点的检查点和批量提交记录
        #[arg(long)]
        purge_checkpoints: bool,
    },
}

fn parse_target(s: &str) -> std::result::Result<PhaseTarget, String> {
    PhaseTarget::parse(s).ok_or_else(|| format!("无法识别的运行目标: {}", s))
}

fn parse_mode(s: &str) -> std::result::Result<ResumeMode, String> {
    ResumeMode::from_name(s).ok_or_else(|| format!("无法识别的续跑模式: {}", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 加载配置
    let config = Config::load(cli.config.as_deref())?;

    // 初始化日志
    logging::init(&config.log_filter, config.verbose_logging);

    let app = App::initialize(config)?;

    match cli.command {
        Command::Run {
            target,
            units,
            resume,
            concurrency,
            atoms_dir,
        } => {
            let job = app
                .run(RunRequest {
                    unit_ids: units,
                    target,
                    resume,
                    max_concurrent_units: concurrency,
                    atoms_dir,
                })
                .await?;
            print_job(&job)?;
        }
        Command::Status { job_id } => print_job(&app.status(&job_id).await?)?,
        Command::List => {
            let jobs = app.list().await?;
            if jobs.is_empty() {
                info!("暂无任务记录");
            }
            for job in jobs {
                println!(
                    "{}  {:<9}  {}  {}/{} 完成, {} 失败",
                    job.job_id,
                    job.status,
                    job.started_at.format("%Y-%m-%d %H:%M:%S"),
                    job.progress.completed,
                    job.progress.total,
                    job.progress.failed
                );
            }
        }
        Command::Resume { job_id, mode } => print_job(&app.resume(&job_id, mode).await?)?,
        Command::Cancel { job_id } => {
            let job = app.cancel(&job_id).await?;
            info!("已写入取消标记: {}", job.job_id);
        }
        Command::Delete {
            job_id,
            purge_checkpoints,
        } => {
            app.delete(&job_id, purge_checkpoints).await?;
            info!("已删除任务 {}", job_id);
        }
    }

    Ok(())
}

fn print_job(job: &Job) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(job)?);
    if job.status == JobStatus::Failed {
        info!("💡 可使用 `question_forge resume {}` 续跑", job.job_id);
    }
    Ok(())
}
