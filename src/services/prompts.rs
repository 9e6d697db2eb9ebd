//! 提示词来源 - 业务能力层
//!
//! 提示词内容不属于流水线核心，这里只约定每个阶段要什么输入、
//! 期望模型回复什么 JSON 形状。实际部署可以替换成自己的实现。

use serde::{Deserialize, Serialize};

use crate::clients::Prompt;
use crate::models::atom::KnowledgeAtom;
use crate::models::checkpoint::PlanSlot;
use crate::models::item::{Exemplar, GeneratedItem};

/// validate 阶段期望的回复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,
    #[serde(default)]
    pub reason: String,
}

pub trait PromptSource: Send + Sync {
    /// 回复任意 JSON 对象
    fn enrich(&self, atom: &KnowledgeAtom) -> Prompt;

    /// 回复 `{"slots": [PlanSlot...]}`
    fn plan(&self, atom: &KnowledgeAtom, knowledge: &serde_json::Value) -> Prompt;

    /// 回复一道题的 `ItemContent` JSON
    fn generate(
        &self,
        atom: &KnowledgeAtom,
        knowledge: &serde_json::Value,
        slot: &PlanSlot,
        exemplar: Option<&Exemplar>,
    ) -> Prompt;

    /// 回复 [`Verdict`]
    fn validate(&self, atom: &KnowledgeAtom, item: &GeneratedItem) -> Prompt;
}

/// 内置的简单提示词
#[derive(Debug, Clone, Default)]
pub struct DefaultPrompts;

const SYSTEM: &str = "你是一名资深的中学命题老师。只输出 JSON，不要输出其他内容。";

impl PromptSource for DefaultPrompts {
    fn enrich(&self, atom: &KnowledgeAtom) -> Prompt {
        let user = format!(
            "请梳理下面知识点的核心概念、常见考法和易错点，输出 JSON 对象 \
             {{\"concepts\": [], \"patterns\": [], \"pitfalls\": []}}。\n\n\
             学科：{}\n年级：{}\n标题：{}\n\n{}",
            atom.subject, atom.grade, atom.title, atom.content
        );
        Prompt::new(Some(SYSTEM), user).with_imgs(atom.imgs.as_deref())
    }

    fn plan(&self, atom: &KnowledgeAtom, knowledge: &serde_json::Value) -> Prompt {
        let exemplar_ids: Vec<&str> = atom.exemplars.iter().map(|e| e.exemplar_id.as_str()).collect();
        let user = format!(
            "根据知识梳理结果规划一组变式题。输出 \
             {{\"slots\": [{{\"slot_id\": \"\", \"intent\": \"\", \
             \"distance_level\": \"near|medium|far\", \"exemplar_id\": null}}]}}。\n\
             可参照的范例 ID：{:?}\n\n知识点：{}\n\n梳理结果：\n{}",
            exemplar_ids,
            atom.title,
            serde_json::to_string_pretty(knowledge).unwrap_or_default()
        );
        Prompt::new(Some(SYSTEM), user)
    }

    fn generate(
        &self,
        atom: &KnowledgeAtom,
        knowledge: &serde_json::Value,
        slot: &PlanSlot,
        exemplar: Option<&Exemplar>,
    ) -> Prompt {
        let exemplar_text = match exemplar {
            Some(e) => format!(
                "参照范例（与范例的差异程度：{}）：\n题干：{}\n选项：{:?}\n答案：{}",
                slot.distance_level.as_str(),
                e.content.stem,
                e.content.choices,
                e.content.answer
            ),
            None => "无参照范例".to_string(),
        };
        let user = format!(
            "按命题意图出一道题，输出 \
             {{\"stem\": \"\", \"choices\": [], \"answer\": \"\", \"analysis\": \"\"}}。\n\
             知识点：{}\n命题意图：{}\n{}\n\n知识梳理：{}",
            atom.title, slot.intent, exemplar_text, knowledge
        );
        Prompt::new(Some(SYSTEM), user)
    }

    fn validate(&self, atom: &KnowledgeAtom, item: &GeneratedItem) -> Prompt {
        let user = format!(
            "检查下面这道题是否科学、答案是否正确、是否考查了知识点「{}」。\
             输出 {{\"valid\": true, \"reason\": \"\"}}。\n\n题干：{}\n选项：{:?}\n答案：{}\n解析：{}",
            atom.title,
            item.content.stem,
            item.content.choices,
            item.content.answer,
            item.content.analysis
        );
        Prompt::new(Some(SYSTEM), user)
    }
}
