//! Evaluation rubrics compiled into the critique prompt.
//!
//! A rubric is static configuration: the ordered scoring dimensions, their
//! scale, and the tone the reviewer should take. Variants differ only in
//! wording and dimension count.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct Dimension {
    /// Stable key used in score maps on the wire.
    pub key: &'static str,
    /// Label the model is told to print in bold before the score.
    pub label: &'static str,
    /// Other spellings accepted when mining scores out of free text.
    pub aliases: &'static [&'static str],
    pub min: f64,
    pub max: f64,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Encouraging,
    Strict,
}

#[derive(Debug, Clone)]
pub struct Rubric {
    pub name: &'static str,
    pub dimensions: Vec<Dimension>,
    pub tone: Tone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RubricVariant {
    #[default]
    Standard,
    Strict,
}

impl RubricVariant {
    pub fn rubric(self) -> Rubric {
        match self {
            RubricVariant::Standard => Rubric::standard(),
            RubricVariant::Strict => Rubric::strict(),
        }
    }
}

const STRUCTURE: Dimension = Dimension {
    key: "structure",
    label: "结构",
    aliases: &["Structure", "字形"],
    min: 1.0,
    max: 10.0,
    description: "字形结构是否稳健匀称，重心是否平稳，部件比例与穿插避让是否得当",
};

const TECHNIQUE: Dimension = Dimension {
    key: "technique",
    label: "笔法",
    aliases: &["Technique", "用笔"],
    min: 1.0,
    max: 10.0,
    description: "起笔、行笔、收笔是否到位，笔画是否流畅自然、提按分明",
};

const COMPOSITION: Dimension = Dimension {
    key: "composition",
    label: "章法",
    aliases: &["Composition", "布局"],
    min: 1.0,
    max: 10.0,
    description: "字在格中的位置与大小是否合适，整体布局与留白是否协调",
};

const ARTISTIC: Dimension = Dimension {
    key: "artistic",
    label: "神韵",
    aliases: &["Artistic", "艺术性"],
    min: 1.0,
    max: 10.0,
    description: "作品的气韵与个人风格，是否在规范之中见生动",
};

const STRENGTH: Dimension = Dimension {
    key: "strength",
    label: "笔力",
    aliases: &["Strength"],
    min: 1.0,
    max: 10.0,
    description: "线条是否有力度与弹性，是否存在虚浮、拖沓的笔画",
};

const INK: Dimension = Dimension {
    key: "ink",
    label: "墨色",
    aliases: &["Ink"],
    min: 1.0,
    max: 10.0,
    description: "线条粗细与浓淡变化是否自然，有无枯笔、涨墨等问题",
};

impl Rubric {
    pub fn standard() -> Self {
        Self {
            name: "standard",
            dimensions: vec![STRUCTURE, TECHNIQUE, COMPOSITION, ARTISTIC],
            tone: Tone::Encouraging,
        }
    }

    pub fn strict() -> Self {
        Self {
            name: "strict",
            dimensions: vec![STRUCTURE, TECHNIQUE, STRENGTH, COMPOSITION, INK, ARTISTIC],
            tone: Tone::Strict,
        }
    }

    pub fn dimension(&self, key: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.key == key)
    }

    pub fn system_prompt(&self) -> String {
        let mut prompt = String::from(
            "你是一位资深的书法老师，正在点评学生在米字格上书写的一个汉字。请仔细观察图片中的笔画，给出专业、具体的点评。",
        );

        prompt.push_str("\n\n=== 评分维度 ===");
        for (index, dim) in self.dimensions.iter().enumerate() {
            prompt.push_str(&format!(
                "\n{}. {}（{}-{}分）：{}",
                index + 1,
                dim.label,
                dim.min,
                dim.max,
                dim.description
            ));
        }

        prompt.push_str("\n\n=== 语气要求 ===");
        match self.tone {
            Tone::Encouraging => {
                prompt.push_str("\n• 以鼓励为主，先肯定优点，再指出可以改进的地方");
                prompt.push_str("\n• 评分客观，初学者的作品通常在6-8分之间");
            }
            Tone::Strict => {
                prompt.push_str("\n• 标准严格，按照碑帖临摹的要求评判，不要轻易给出高分");
                prompt.push_str("\n• 直接指出问题所在，并说明如何纠正");
            }
        }
        prompt.push_str("\n• 如果画面为空白或无法辨认，请如实说明，并给出最低分");

        prompt.push_str("\n\n=== 输出格式（使用 Markdown） ===");
        prompt.push_str("\n## 评分");
        for dim in &self.dimensions {
            prompt.push_str(&format!("\n- **{}**：X.X 分", dim.label));
        }
        prompt.push_str("\n\n## 整体评价\n一到两句话的总体印象。");
        prompt.push_str("\n\n### 优点\n- 列出两到三条");
        prompt.push_str("\n\n### 建议改进\n- 列出两到三条，每条给出具体练习方法");
        prompt.push_str("\n\n### 总结\n**总分**：各维度分数的平均值，保留一位小数。");
        prompt.push_str("\n\n每个分数都保留一位小数，并紧跟在加粗的维度名称之后。");

        prompt
    }

    pub fn user_prompt(&self) -> String {
        "请点评这幅书法练习作品。".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_rubric_has_four_dimensions_in_order() {
        let rubric = Rubric::standard();
        let keys: Vec<_> = rubric.dimensions.iter().map(|d| d.key).collect();
        assert_eq!(keys, ["structure", "technique", "composition", "artistic"]);
    }

    #[test]
    fn prompt_lists_every_bold_label() {
        for variant in [RubricVariant::Standard, RubricVariant::Strict] {
            let rubric = variant.rubric();
            let prompt = rubric.system_prompt();
            for dim in &rubric.dimensions {
                assert!(prompt.contains(&format!("**{}**", dim.label)), "{}", dim.label);
            }
            assert!(prompt.contains("**总分**"));
        }
    }

    #[test]
    fn variant_deserializes_from_lowercase() {
        let v: RubricVariant = serde_json::from_str("\"strict\"").unwrap();
        assert_eq!(v, RubricVariant::Strict);
        assert_eq!(v.rubric().dimensions.len(), 6);
    }
}
