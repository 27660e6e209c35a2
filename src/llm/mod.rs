//! LLM 层：Model Gateway 抽象与实现（OpenAI / Azure OpenAI / Scripted）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use mock::{RecordedCall, ScriptedGateway};
pub use openai::{Endpoint, GatewayConfig, OpenAiGateway, TokenUsage, DEFAULT_OPENAI_BASE_URL};
pub use traits::{LlmError, ModelEvent, ModelEventStream, ModelGateway};

use crate::config::{LlmProvider, LlmSection};

/// 把 [llm] 配置转换为显式的 GatewayConfig（mock 后端不需要）
pub fn gateway_config(section: &LlmSection) -> Result<GatewayConfig, LlmError> {
    let endpoint = match section.provider {
        LlmProvider::OpenAi => Endpoint::OpenAi {
            base_url: section
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
        },
        LlmProvider::Azure => Endpoint::Azure {
            endpoint: section
                .azure
                .endpoint
                .clone()
                .ok_or_else(|| LlmError::Config("llm.azure.endpoint is not set".to_string()))?,
            deployment: section
                .azure
                .deployment
                .clone()
                .unwrap_or_else(|| section.model.clone()),
            api_version: section.azure.api_version.clone(),
        },
        LlmProvider::Mock => {
            return Err(LlmError::Config(
                "mock provider has no HTTP endpoint".to_string(),
            ))
        }
    };
    let api_key = section
        .api_key
        .clone()
        .ok_or_else(|| LlmError::Config("no API key configured".to_string()))?;

    Ok(GatewayConfig {
        endpoint,
        api_key,
        model: section.model.clone(),
        temperature: section.temperature,
        streaming: section.streaming,
        timeout: Duration::from_secs(section.timeout_secs),
    })
}

/// 根据配置创建 Model Gateway
pub fn create_gateway(section: &LlmSection) -> Result<Arc<dyn ModelGateway>, LlmError> {
    match section.provider {
        LlmProvider::Mock => {
            tracing::info!("Using scripted echo gateway");
            Ok(Arc::new(
                ScriptedGateway::echo().with_streaming(section.streaming),
            ))
        }
        provider => {
            let gateway = OpenAiGateway::new(gateway_config(section)?)?;
            tracing::info!(provider = ?provider, url = %gateway.url(), model = %section.model, "Using OpenAI-compatible gateway");
            Ok(Arc::new(gateway))
        }
    }
}
