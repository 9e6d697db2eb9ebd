//! # Question Forge
//!
//! 知识点 → 题目 的多阶段生成流水线
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有持久化资源，只暴露能力
//! - `CheckpointStore` - 按（知识点, 阶段）原子写入阶段产出
//! - `JobStore` / `BatchStore` - 任务记录与批量提交记录
//! - `Clock` - 可注入的时钟，测试中不真实睡眠
//!
//! ### ② 客户端层（Clients）
//! - `clients/` - 外部协作方的 trait 与实现
//! - `InferenceProvider` - 同步推理（OpenAI 兼容接口）
//! - `BatchService` - 异步批处理（上传、提交、查询、下载、列举）
//! - `ItemSink` - 成品题目落库
//!
//! ### ③ 业务能力层（Services）
//! - `services/` - 描述"我能做什么"
//! - `fingerprint` / `DuplicateGate` - 指纹、骨架与去重门控
//! - `FallbackInference` - 重试与模型降级
//! - `BatchLifecycleManager` - 批量提交状态机与崩溃后重新挂接
//!
//! ### ④ 流程层（Workflow）
//! - `workflow/` - 定义"一个知识点"的完整阶段流程
//! - `UnitCtx` - 上下文封装（job_id + 知识点）
//! - `PhaseOrchestrator` - 阶段编排（enrich → plan → generate → validate → finalize）
//!
//! ### ⑤ 编排层（Orchestration）
//! - `orchestrator/job_runner` - 任务运行器，管理并发、取消、续跑
//!
//! ## 模块结构

pub mod app;
pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{PipelineError, Result};
pub use models::{Job, JobStatus, KnowledgeAtom, Phase, PhaseTarget, ResumeMode};
pub use orchestrator::JobRunner;
pub use workflow::{PhaseOrchestrator, UnitCtx};
