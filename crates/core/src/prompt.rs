use crate::intent::ConversationIntent;

const PERSONA: &str = "你是企业健康咨询助手\"小星\"，负责为员工提供专业的健康咨询服务。

你的服务范围：
1. 营养膳食建议 - 分析食物营养成分，推荐健康饮食方案
2. 健身计划指导 - 根据身体状况制定运动计划
3. 亚健康调理咨询 - 提供专业的亚健康状态调理建议
4. 健康知识普及 - 解答各种健康相关问题

回答要求：
- 专业、友善、实用
- 基于科学依据，避免提供不实信息
- 如果不确定，建议咨询专业医生
- 回答简洁明了，避免过于冗长
";

const IMAGE_NOTICE: &str = "\n注意：用户上传了一张图片，请结合图片内容回答。";

/// Assembles the single user message sent to the chat model.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn build(
        &self,
        user_input: &str,
        retrieved_docs: &[String],
        intent: ConversationIntent,
        has_image: bool,
    ) -> String {
        let mut prompt = String::from(PERSONA);

        if !retrieved_docs.is_empty() {
            prompt.push_str("\n相关知识库内容：\n");
            prompt.push_str(&retrieved_docs.join("\n"));
            prompt.push('\n');
        }

        if has_image {
            prompt.push_str(IMAGE_NOTICE);
        }

        prompt.push_str("\n用户问题：");
        prompt.push_str(user_input);
        prompt.push_str("\n\n请提供专业建议：");

        tracing::debug!(
            intent = %intent,
            docs = retrieved_docs.len(),
            has_image,
            chars = prompt.chars().count(),
            "prompt built"
        );
        prompt
    }
}
