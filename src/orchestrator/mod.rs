//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责任务级调度，是整个系统的"指挥中心"。
//!
//! ### `job_runner` - 任务运行器
//! - 持有任务记录（JobStore），每个单元结束后落盘
//! - 控制并发数量（Semaphore），分波处理知识点
//! - 对外提供 start / status / list / cancel / resume / delete
//!
//! ## 层次关系
//!
//! ```text
//! job_runner (处理 Vec<KnowledgeAtom>)
//!     ↓
//! workflow::PhaseOrchestrator (处理单个知识点的阶段序列)
//!     ↓
//! services (能力层：inference / batch / duplicate gate)
//!     ↓
//! infrastructure (基础设施：检查点、任务、批量提交的持久化)
//! ```
//!
//! 编排层只做调度和统计，不做具体业务判断。

pub mod job_runner;

pub use job_runner::JobRunner;
