//! OpenAI 兼容的同步推理客户端
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 兼容 OpenAI API 的服务（如 Azure, Gemini, Doubao 等）

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageDetail,
        ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::clients::{InferenceProvider, InvokeOptions, Prompt};
use crate::config::Config;
use crate::error::{PipelineError, Result};

/// 基于 async-openai 的推理服务
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model_name: String,
    name: String,
}

impl OpenAiProvider {
    pub fn new(config: &Config) -> Self {
        Self::with_model(config, config.llm_model_name.clone())
    }

    /// 同一端点下的其他模型（备用模型）
    pub fn with_model(config: &Config, model_name: impl Into<String>) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        let model_name = model_name.into();
        Self {
            client: Client::with_config(openai_config),
            name: format!("llm:{}", model_name),
            model_name,
        }
    }

    fn build_messages(&self, prompt: &Prompt) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut messages = Vec::new();

        if let Some(sys_msg) = &prompt.system {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(sys_msg.as_str())
                .build()
                .map_err(|e| PipelineError::external(&self.name, e))?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }

        // 有图片时走 Vision 多段内容
        let user_msg = if prompt.imgs.is_empty() {
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt.user.as_str())
                .build()
        } else {
            let mut content_parts = vec![ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText {
                    text: prompt.user.clone(),
                },
            )];
            for url in &prompt.imgs {
                content_parts.push(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                    ChatCompletionRequestMessageContentPartImage {
                        image_url: ImageUrl {
                            url: url.clone(),
                            detail: Some(ImageDetail::Auto),
                        },
                    },
                ));
            }
            debug!("使用 Vision API，包含 {} 张图片", prompt.imgs.len());
            ChatCompletionRequestUserMessageArgs::default()
                .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
                .build()
        }
        .map_err(|e| PipelineError::external(&self.name, e))?;

        messages.push(ChatCompletionRequestMessage::User(user_msg));
        Ok(messages)
    }
}

#[async_trait]
impl InferenceProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, prompt: &Prompt, options: &InvokeOptions) -> Result<String> {
        debug!("调用 LLM API，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字符", prompt.user.len());

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(self.build_messages(prompt)?)
            .temperature(options.temperature)
            .max_tokens(options.max_tokens)
            .build()
            .map_err(|e| PipelineError::external(&self.name, e))?;

        let response = tokio::time::timeout(options.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| PipelineError::ExternalTimeout {
                service: self.name.clone(),
                timeout_ms: options.timeout.as_millis() as u64,
            })?
            .map_err(|e| {
                warn!("LLM API 调用失败: {}", e);
                PipelineError::external(&self.name, e)
            })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| PipelineError::external(&self.name, "LLM 返回内容为空"))?;

        Ok(content.trim().to_string())
    }
}
