use serde::{Deserialize, Serialize};

use crate::models::item::Exemplar;

/// 知识点（工作单元的输入）
///
/// 由文档抽取环节产出的 TOML 文件加载而来，正文对流水线而言是不透明的
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeAtom {
    #[serde(deserialize_with = "deserialize_atom_id")]
    pub atom_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub grade: String,
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imgs: Option<Vec<String>>,
    #[serde(default)]
    pub exemplars: Vec<Exemplar>,
    #[serde(skip_serializing, skip_deserializing)]
    pub file_path: Option<String>,
}

impl KnowledgeAtom {
    /// 按 ID 查找范例题
    pub fn exemplar(&self, exemplar_id: &str) -> Option<&Exemplar> {
        self.exemplars.iter().find(|e| e.exemplar_id == exemplar_id)
    }

    pub fn with_file_path(mut self, file_path: String) -> Self {
        self.file_path = Some(file_path);
        self
    }
}

// atom_id 在抽取结果里可能是字符串也可能是整数
fn deserialize_atom_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Visitor;
    use std::fmt;

    struct AtomIdVisitor;

    impl<'de> Visitor<'de> for AtomIdVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or integer atom id")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value.trim().is_empty() {
                return Err(E::custom("atom_id 不能为空"));
            }
            Ok(value.trim().to_string())
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(value.to_string())
        }
    }

    deserializer.deserialize_any(AtomIdVisitor)
}
