use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationIntent {
    Nutrition,
    Fitness,
    SubHealth,
    #[default]
    HealthKnowledge,
    /// Reserved; never produced by keyword matching.
    Chitchat,
}

impl ConversationIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationIntent::Nutrition => "nutrition",
            ConversationIntent::Fitness => "fitness",
            ConversationIntent::SubHealth => "sub_health",
            ConversationIntent::HealthKnowledge => "health_knowledge",
            ConversationIntent::Chitchat => "chitchat",
        }
    }
}

impl fmt::Display for ConversationIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const NUTRITION_KEYWORDS: &[&str] = &["吃", "食物", "营养", "饮食", "餐", "膳食", "健康食谱"];
pub const FITNESS_KEYWORDS: &[&str] = &["运动", "健身", "锻炼", "减肥", "增肌", "训练", "体育"];
pub const SUB_HEALTH_KEYWORDS: &[&str] = &["疲劳", "失眠", "睡眠", "亚健康", "调理", "不舒服", "症状"];

/// Outcome of a classification, with the keyword that decided it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntentMatch {
    pub intent: ConversationIntent,
    pub keyword: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct IntentClassifier {
    rules: Vec<(ConversationIntent, &'static [&'static str])>,
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self {
            rules: vec![
                (ConversationIntent::Nutrition, NUTRITION_KEYWORDS),
                (ConversationIntent::Fitness, FITNESS_KEYWORDS),
                (ConversationIntent::SubHealth, SUB_HEALTH_KEYWORDS),
            ],
        }
    }
}

impl IntentClassifier {
    /// First rule with any substring hit wins; rules are tried in priority order.
    pub fn classify(&self, text: &str) -> IntentMatch {
        let lowered = text.to_lowercase();
        for (intent, keywords) in &self.rules {
            if let Some(keyword) = keywords.iter().find(|k| lowered.contains(**k)) {
                tracing::debug!(intent = %intent, keyword, "intent matched");
                return IntentMatch {
                    intent: *intent,
                    keyword: Some(keyword),
                };
            }
        }

        IntentMatch {
            intent: ConversationIntent::HealthKnowledge,
            keyword: None,
        }
    }
}

#[cfg(test)]
#[path = "intent_tests.rs"]
mod tests;
