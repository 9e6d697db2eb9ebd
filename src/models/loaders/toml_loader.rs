use crate::error::{PipelineError, Result};
use crate::models::atom::KnowledgeAtom;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 从 TOML 文件加载知识点
pub async fn load_atom_file(toml_file_path: &Path) -> Result<KnowledgeAtom> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .map_err(|e| PipelineError::storage(toml_file_path.display(), e))?;

    let atom: KnowledgeAtom = toml::from_str(&content).map_err(|e| {
        PipelineError::parse(format!("知识点文件 {}", toml_file_path.display()), e)
    })?;

    Ok(atom.with_file_path(toml_file_path.to_string_lossy().to_string()))
}

/// 加载文件夹中的全部知识点（按文件名排序，解析失败的文件跳过）
///
/// 多个文件声明同一个 `atom_id` 时只保留文件名靠前的那个。
pub async fn load_all_atoms(folder_path: &str) -> Result<Vec<KnowledgeAtom>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        return Err(PipelineError::Config(format!("文件夹不存在: {}", folder_path)));
    }

    let mut toml_files = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .map_err(|e| PipelineError::storage(folder_path, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::storage(folder_path, e))?
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml_files.push(path);
        }
    }
    toml_files.sort();

    let mut atoms = Vec::new();
    let mut seen = HashSet::new();
    for path in toml_files {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_atom_file(&path).await {
            Ok(atom) if !seen.insert(atom.atom_id.clone()) => {
                tracing::warn!(
                    "知识点 ID {} 重复，跳过文件 {}",
                    atom.atom_id,
                    path.display()
                );
            }
            Ok(atom) => {
                tracing::info!(
                    "成功加载知识点 {} ({} 道范例)",
                    atom.atom_id,
                    atom.exemplars.len()
                );
                atoms.push(atom);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {}", path.display(), e);
            }
        }
    }

    Ok(atoms)
}
