//! 指纹与骨架 - 业务能力层
//!
//! 只负责"把一道题变成可比较的签名"，不关心池子和门控策略
//!
//! - 指纹：规范化内容的 SHA-256，选项顺序不影响结果
//! - 骨架：数值和引号字面量替换为占位符后的结构
//! - 数值签名：题中所有数值字面量（排序后的多重集）的 SHA-256

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::models::item::ItemContent;

pub const NUM_PLACEHOLDER: &str = "<NUM>";
pub const STR_PLACEHOLDER: &str = "<STR>";

static NUMBER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+(?:\.\d+)?(?:/\d+(?:\.\d+)?)?%?").expect("number regex is valid")
});

static QUOTED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""[^"]*"|“[^”]*”|'[^']*'|‘[^’]*’|「[^」]*」|《[^》]*》"#)
        .expect("quoted regex is valid")
});

// A. / B、 / (C) / D: 形式的选项标号
static CHOICE_LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\(\s*[A-Ha-h]\s*\)|[A-Ha-h]\s*[.、:)])\s*").expect("label regex is valid")
});

static ANSWER_LABELS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Ha-h](?:\s*[,、]?\s*[A-Ha-h])*$").expect("answer regex is valid")
});

/// 一道题的三种签名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub fingerprint: String,
    pub skeleton: String,
    pub numeric_signature: String,
}

impl Signature {
    pub fn of(content: &ItemContent) -> Self {
        let canonical = Canonical::from_content(content);
        Self {
            fingerprint: canonical.fingerprint(),
            skeleton: canonical.skeleton(),
            numeric_signature: canonical.numeric_signature(),
        }
    }
}

pub fn fingerprint(content: &ItemContent) -> String {
    Canonical::from_content(content).fingerprint()
}

pub fn skeleton(content: &ItemContent) -> String {
    Canonical::from_content(content).skeleton()
}

pub fn numeric_signature(content: &ItemContent) -> String {
    Canonical::from_content(content).numeric_signature()
}

/// 规范化后的题目：选项去标号并排序，字母答案解析为选项文本
#[derive(Debug, Clone, PartialEq)]
struct Canonical {
    stem: String,
    choices: Vec<String>,
    answer: Vec<String>,
}

impl Canonical {
    fn from_content(content: &ItemContent) -> Self {
        let raw_choices: Vec<String> = content
            .choices
            .iter()
            .map(|c| normalize_text(&strip_choice_label(&fold_width(c))))
            .collect();

        let answer = resolve_answer(&content.answer, &raw_choices);

        let mut choices = raw_choices;
        choices.sort();

        Self {
            stem: normalize_text(&content.stem),
            choices,
            answer,
        }
    }

    fn fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "stem": self.stem,
            "choices": self.choices,
            "answer": self.answer,
        });
        sha256_hex(canonical.to_string().as_bytes())
    }

    fn skeleton(&self) -> String {
        let mut choices: Vec<String> = self.choices.iter().map(|c| skeletonize(c)).collect();
        choices.sort();
        let answer: Vec<String> = self.answer.iter().map(|a| skeletonize(a)).collect();
        format!(
            "{}|{}|{}",
            skeletonize(&self.stem),
            choices.join("‖"),
            answer.join("‖")
        )
    }

    fn numeric_signature(&self) -> String {
        let mut numbers = Vec::new();
        numbers.extend(numeric_literals(&self.stem));
        for choice in &self.choices {
            numbers.extend(numeric_literals(choice));
        }
        for answer in &self.answer {
            numbers.extend(numeric_literals(answer));
        }
        numbers.sort();
        sha256_hex(numbers.join(",").as_bytes())
    }
}

/// 全角字符折叠为半角
fn fold_width(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{3000}' => ' ',
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            _ => c,
        })
        .collect()
}

/// 折叠全角、合并空白、转小写
pub fn normalize_text(text: &str) -> String {
    fold_width(text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn strip_choice_label(choice: &str) -> String {
    CHOICE_LABEL_REGEX.replace(choice.trim(), "").to_string()
}

/// 字母答案（如 `B`、`A,C`）解析为对应选项文本，其余按普通文本规范化
fn resolve_answer(answer: &str, choices: &[String]) -> Vec<String> {
    let folded = fold_width(answer);
    let trimmed = folded.trim();

    if !choices.is_empty() && ANSWER_LABELS_REGEX.is_match(trimmed) {
        let mut resolved = Vec::new();
        for c in trimmed.chars().filter(|c| c.is_ascii_alphabetic()) {
            let idx = (c.to_ascii_uppercase() as u8 - b'A') as usize;
            match choices.get(idx) {
                Some(text) => resolved.push(text.clone()),
                None => return vec![normalize_text(trimmed)],
            }
        }
        resolved.sort();
        resolved.dedup();
        return resolved;
    }

    let normalized = normalize_text(trimmed);
    if normalized.is_empty() {
        Vec::new()
    } else {
        vec![normalized]
    }
}

/// 字面量替换为占位符
pub fn skeletonize(text: &str) -> String {
    let without_quotes = QUOTED_REGEX.replace_all(text, STR_PLACEHOLDER);
    NUMBER_REGEX
        .replace_all(&without_quotes, NUM_PLACEHOLDER)
        .to_string()
}

/// 提取规范化后的数值字面量（带负号）
pub fn numeric_literals(text: &str) -> Vec<String> {
    NUMBER_REGEX
        .find_iter(text)
        .map(|m| {
            let negative = is_negative_sign(&text[..m.start()]);
            let value = normalize_number(m.as_str());
            if negative {
                format!("-{}", value)
            } else {
                value
            }
        })
        .collect()
}

// 前一个字符是 '-'，且再往前不是数字/字母/右括号（排除 "3-2" 这类减号）
fn is_negative_sign(prefix: &str) -> bool {
    let mut rev = prefix.chars().rev();
    match rev.next() {
        Some('-') => !matches!(rev.next(), Some(c) if c.is_alphanumeric() || c == ')'),
        _ => false,
    }
}

fn normalize_number(raw: &str) -> String {
    let (body, percent) = match raw.strip_suffix('%') {
        Some(b) => (b, "%"),
        None => (raw, ""),
    };
    let body = match body.split_once('/') {
        Some((num, den)) => format!("{}/{}", normalize_decimal(num), normalize_decimal(den)),
        None => normalize_decimal(body),
    };
    format!("{}{}", body, percent)
}

fn normalize_decimal(raw: &str) -> String {
    let (int_part, frac_part) = match raw.split_once('.') {
        Some((i, f)) => (i, f.trim_end_matches('0')),
        None => (raw, ""),
    };
    let int_part = int_part.trim_start_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{}.{}", int_part, frac_part)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
