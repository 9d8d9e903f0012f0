// src/llm_extract.rs

use crate::config::LlmSection;
use crate::error::ScanError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

/// The instruction block sent ahead of the transcript. The completion service
/// fills the `extract_receipt_details` schema from this text.
const EXTRACTION_PROMPT: &str = r#"You are a receipt data extraction assistant.
Given the text of a scanned paper receipt, extract the purchase details.

- Store name: choose the most probable store or brand name. If scanning garbled it, infer the closest known brand.
- Date: return the date and time in full ISO 8601 format (e.g. 2024-03-08T14:21:00Z), including both date and time.
- Total: the final amount paid after all discounts and taxes, never a subtotal.
- Items: list every purchased item with its quantity, unit price and line total. Correct misread item names to the closest plausible product or brand name.
- Payment type: identify the payment method (credit card, cash, etc.) from keywords in the text.
- Discounts: amounts written with a minus sign or hyphen before or after the number are discounts; "30-", "-30" and "30 -" all count. Words that indicate a discount in any language, such as "trophy", "Bon", "Rabatt" or "Discount", also mark one, and numbers next to such words count too.
- discountsTotal must be the sum of every discount found this way.
- Quantity is not always a whole number; it may be grams or another unit. Take the quantity as printed, or add up repeated occurrences of the same item. Never derive a quantity by dividing the line total by the price.
- Price must be the unit price as printed on the receipt; there is always a number for it. Never compute it from the line total and quantity.
- Currency: use the official symbol or abbreviation. If none is printed, infer one from the country or context, or fall back to "$".

The text comes from optical recognition of a photo and may be disordered or contain mistakes. Use context to reassemble it: numbers tend to sit next to "total", "subtotal", "discount" or an item name. Never invent items that are not present in the text."#;

/// Transcripts longer than this are truncated before being embedded, to stay
/// within the completion context window.
const MAX_TRANSCRIPT_CHARS: usize = 8_000;

const FUNCTION_NAME: &str = "extract_receipt_details";

/// JSON schema for the function/tool the service is asked to call.
fn receipt_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "storeName": { "type": "string" },
            "date": { "type": "string" },
            "total": { "type": "number" },
            "paymentType": { "type": "string" },
            "discountsTotal": { "type": "number" },
            "currency": { "type": "string" },
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "category": { "type": "string" },
                        "quantity": { "type": "number" },
                        "price": { "type": "number" },
                        "total": { "type": "number" },
                        "discount": { "type": "number" }
                    },
                    "required": ["name", "quantity", "price", "total"]
                }
            }
        },
        "required": ["storeName", "date", "total", "items", "discountsTotal", "currency"]
    })
}

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    functions: Vec<FunctionSpec>,
    function_call: FunctionTarget,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct FunctionSpec {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct FunctionTarget {
    name: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    function_call: Option<FunctionCallArguments>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FunctionCallArguments {
    arguments: String,
}

/// Payload decoded from the service response. Required fields are plain so a
/// missing one fails the decode of the whole payload; optional fields stay
/// absent here and get their defaults in the assembler.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptPayload {
    pub store_name: String,
    pub date: String,
    pub total: f64,
    pub payment_type: Option<String>,
    pub discounts_total: Option<f64>,
    pub currency: String,
    pub items: Vec<ItemPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemPayload {
    pub name: String,
    pub category: Option<String>,
    pub quantity: Option<f64>,
    pub price: f64,
    pub total: f64,
    pub discount: Option<f64>,
}

/// One request/response exchange with the completion service. Injected so
/// tests (and alternative backends) can stand in for the HTTPS transport.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ScanError>;
}

/// Production transport: one HTTPS POST to a chat-completions endpoint.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    /// The API key comes from the environment, never from the config file.
    pub fn from_config(llm: &LlmSection) -> Result<Self, ScanError> {
        let api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| ScanError::Transport("LLM_API_KEY env var is not set".to_string()))?;
        info!(url = %llm.base_url, model = %llm.model, "Using completion endpoint");
        Ok(HttpTransport {
            client: Client::new(),
            base_url: llm.base_url.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ScanError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ScanError::Transport(format!(
                "completion API error {status}: {body}"
            )));
        }

        let decoded: ChatResponse = response
            .json()
            .await
            .map_err(|e| ScanError::Schema(format!("response body was not valid JSON: {e}")))?;
        Ok(decoded)
    }
}

/// Builds the extraction request for one transcript and decodes the service's
/// answer against the receipt schema.
pub struct ReceiptExtractor {
    transport: Arc<dyn CompletionTransport>,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl ReceiptExtractor {
    pub fn new(transport: Arc<dyn CompletionTransport>, llm: &LlmSection) -> Self {
        ReceiptExtractor {
            transport,
            model: llm.model.clone(),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
        }
    }
}

/// The extraction stage as the orchestrator sees it.
#[async_trait]
pub trait ReceiptExtraction: Send + Sync {
    async fn extract(&self, transcript: &str) -> Result<ReceiptPayload, ScanError>;
}

#[async_trait]
impl ReceiptExtraction for ReceiptExtractor {
    async fn extract(&self, transcript: &str) -> Result<ReceiptPayload, ScanError> {
        let text = if transcript.len() > MAX_TRANSCRIPT_CHARS {
            warn!(
                chars = transcript.len(),
                cap = MAX_TRANSCRIPT_CHARS,
                "Transcript truncated before extraction"
            );
            let mut cut = MAX_TRANSCRIPT_CHARS;
            while !transcript.is_char_boundary(cut) {
                cut -= 1;
            }
            &transcript[..cut]
        } else {
            transcript
        };

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: EXTRACTION_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!(
                        "Extract the receipt details from the following scanned text:\n\n{text}"
                    ),
                },
            ],
            functions: vec![FunctionSpec {
                name: FUNCTION_NAME.to_string(),
                description: "Extracts details from a receipt text.".to_string(),
                parameters: receipt_schema(),
            }],
            function_call: FunctionTarget {
                name: FUNCTION_NAME.to_string(),
            },
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self.transport.complete(&request).await?;
        let payload = decode_payload(&response)?;
        info!(
            store = %payload.store_name,
            items = payload.items.len(),
            total = payload.total,
            "Extraction result decoded"
        );
        Ok(payload)
    }
}

/// The two response shapes the service may answer with.
enum PayloadSource<'a> {
    /// Dedicated function-call arguments: already a JSON string.
    FunctionCall(&'a str),
    /// Plain message content that itself is (possibly fenced) JSON.
    MessageContent(&'a str),
}

/// Resolve which shape carried the payload, then run the common decoder.
fn decode_payload(response: &ChatResponse) -> Result<ReceiptPayload, ScanError> {
    let message = &response
        .choices
        .first()
        .ok_or_else(|| ScanError::Schema("empty response from completion service".to_string()))?
        .message;

    let source = if let Some(call) = &message.function_call {
        PayloadSource::FunctionCall(&call.arguments)
    } else if let Some(content) = &message.content {
        PayloadSource::MessageContent(content)
    } else {
        return Err(ScanError::Schema(
            "response carried neither function-call arguments nor message content".to_string(),
        ));
    };

    let json_str = match source {
        PayloadSource::FunctionCall(arguments) => arguments,
        PayloadSource::MessageContent(content) => extract_json_object(strip_fences(content))?,
    };

    serde_json::from_str(json_str)
        .map_err(|e| ScanError::Schema(format!("payload did not match the receipt schema: {e}")))
}

/// Strip markdown fences if the model added them despite instructions.
fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Slice out the outermost JSON object from a string that may carry
/// surrounding prose.
fn extract_json_object(s: &str) -> Result<&str, ScanError> {
    let start = s
        .find('{')
        .ok_or_else(|| ScanError::Schema("no '{' found in message content".to_string()))?;
    let end = s
        .rfind('}')
        .ok_or_else(|| ScanError::Schema("no '}' found in message content".to_string()))?;
    if end <= start {
        return Err(ScanError::Schema(
            "malformed JSON in message content".to_string(),
        ));
    }
    Ok(&s[start..=end])
}
