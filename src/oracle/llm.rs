//! Language-model oracle over an OpenAI-compatible chat completions API
//!
//! The model sees the indicator snapshot of every timeframe, the position,
//! the account with its margin health, its own recent decisions on the
//! symbol and the risk constraints. It must answer with one JSON object
//! describing its decision.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{DecisionOracle, OracleError};
use crate::config::OracleConfig;
use crate::models::{Action, Decision, DecisionRequest};

const MAX_TOKENS: u32 = 1024;
const RETRY_BASE_DELAY_MS: u64 = 500;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const SYSTEM_PROMPT: &str = "You are a disciplined crypto futures trader. \
Analyze the technical indicators across timeframes, the open position and the account, \
then decide one action for the symbol. Respond with a single JSON object only, no markdown: \
{\"action\": \"OPEN_LONG|OPEN_SHORT|CLOSE_LONG|CLOSE_SHORT|HOLD\", \
\"position_size_usd\": number or null, \"price_hint\": number or null, \
\"stop_loss_price\": number or null, \"take_profit_price\": number or null, \
\"reasoning\": string, \"confidence\": number between 0 and 1}. \
Closing actions close the whole position.";

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ModelDecision {
    action: String,
    #[serde(default, alias = "size_hint", alias = "size_usd")]
    position_size_usd: Option<f64>,
    #[serde(default)]
    price_hint: Option<f64>,
    #[serde(default, alias = "stop_loss")]
    stop_loss_price: Option<f64>,
    #[serde(default, alias = "take_profit")]
    take_profit_price: Option<f64>,
    #[serde(default)]
    reasoning: String,
    confidence: f64,
}

pub struct LlmOracle {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_retries: u32,
    temperature: f64,
}

/// Strip markdown fences and any prose around the JSON object
fn extract_json(text: &str) -> &str {
    let text = text.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .map(|t| t.trim_end().trim_end_matches("```").trim())
        .unwrap_or(text);

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

/// Parse the model's answer into a Decision
///
/// An unknown action is kept as `Action::Invalid` for the risk gate to reject.
pub fn parse_decision(text: &str) -> Result<Decision, OracleError> {
    let parsed: ModelDecision = serde_json::from_str(extract_json(text))
        .map_err(|e| OracleError::Malformed(format!("{}: {}", e, text)))?;

    // zero means "no preference" in the prompt contract
    let size_hint = parsed.position_size_usd.filter(|size| *size != 0.0);

    Ok(Decision {
        action: Action::from(parsed.action),
        size_hint,
        price_hint: parsed.price_hint,
        stop_loss: parsed.stop_loss_price,
        take_profit: parsed.take_profit_price,
        reasoning: parsed.reasoning,
        confidence: parsed.confidence,
    })
}

/// Render the request as the user message
pub fn build_prompt(request: &DecisionRequest) -> String {
    let indicators: Vec<String> = request
        .indicators
        .iter()
        .map(|set| {
            let values: Vec<String> = set
                .values
                .iter()
                .map(|(name, value)| format!("{}: {:.6}", name, value))
                .collect();
            format!(
                "[{} indicators, as of {}]\n{}",
                set.timeframe,
                set.as_of.format("%H:%M"),
                values.join("\n")
            )
        })
        .collect();

    let position = &request.position;
    let position = if position.is_open() {
        format!(
            "{:?} {} @ {:.6}, leverage {}x, unrealized PnL {:.2}",
            position.side, position.size, position.entry_price, position.leverage, position.unrealized_pnl
        )
    } else {
        "None".to_string()
    };

    let balance = &request.balance;
    let margin = &request.margin;

    let history = if request.trade_history.is_empty() {
        "None".to_string()
    } else {
        request
            .trade_history
            .iter()
            .map(|past| {
                let order = match (past.order_status, past.fill_price) {
                    (Some(status), Some(price)) => format!("{} @ {:.6}", status.as_str(), price),
                    (Some(status), None) => status.as_str().to_string(),
                    (None, _) => "no order".to_string(),
                };
                format!(
                    "{} {} ({}): {}",
                    past.decided_at.format("%Y-%m-%d %H:%M"),
                    past.action,
                    order,
                    past.reasoning
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"Symbol: {}
Time (UTC): {}
Last price: {:.6}

{}

[Position]
{}

[Account]
Total: {:.2}, available: {:.2}, unrealized PnL: {:.2}, realized PnL today: {:.2}

[Margin health]
Margin used: {:.2} ({:.1}% of total), risk level {}{}

[Recent decisions, newest first]
{}

[Risk constraints]
{}
"#,
        request.symbol,
        request.requested_at.format("%Y-%m-%d %H:%M:%S"),
        request.last_price,
        indicators.join("\n\n"),
        position,
        balance.total,
        balance.available,
        balance.unrealized_pnl,
        balance.realized_pnl_today,
        margin.margin_used,
        margin.margin_ratio * 100.0,
        margin.risk.as_str(),
        if margin.liquidation_risk() { ", liquidation risk" } else { "" },
        history,
        request.risk_constraints
    )
}

impl LlmOracle {
    pub fn new(config: &OracleConfig) -> Result<Self, OracleError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| OracleError::Unavailable("oracle.api_key is required".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries,
            temperature: config.temperature,
        })
    }

    async fn complete(&self, prompt: String) -> Result<String, OracleError> {
        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            temperature: self.temperature,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
        };

        let mut retry_count = 0;
        loop {
            if retry_count > 0 {
                let delay_ms = RETRY_BASE_DELAY_MS * 2_u64.pow(retry_count - 1);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            let result = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", &self.api_key))
                .json(&request)
                .send()
                .await;

            let last_error = match result {
                Ok(response) if response.status().is_success() => {
                    let body: ChatResponse = response
                        .json()
                        .await
                        .map_err(|e| OracleError::Malformed(e.to_string()))?;
                    return body
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| OracleError::Malformed("no choices in response".to_string()));
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    let message = format!("API error {}: {}", status, body);
                    // rate limits and server errors are retried, the rest are final
                    if status.as_u16() != 429 && !status.is_server_error() {
                        return Err(OracleError::Unavailable(message));
                    }
                    message
                }
                Err(e) if e.is_timeout() => return Err(OracleError::Timeout),
                Err(e) => format!("network error: {}", e),
            };

            retry_count += 1;
            if retry_count > self.max_retries {
                return Err(OracleError::Unavailable(last_error));
            }
            tracing::warn!(attempt = retry_count, error = %last_error, "Oracle request failed, retrying");
        }
    }
}

#[async_trait]
impl DecisionOracle for LlmOracle {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, OracleError> {
        let text = self.complete(build_prompt(request)).await?;
        let decision = parse_decision(&text)?;

        tracing::info!(
            symbol = %request.symbol,
            model = %self.model,
            action = %decision.action,
            confidence = decision.confidence,
            "LLM decision"
        );

        Ok(decision)
    }

    fn name(&self) -> &str {
        "llm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OracleProvider;
    use crate::models::{
        Balance, IndicatorSet, MarginHealth, MarginRisk, OrderStatus, PastDecision, Position,
        Timeframe,
    };
    use chrono::Utc;
    use mockito::Matcher;
    use std::collections::BTreeMap;

    fn create_test_request() -> DecisionRequest {
        let now = Utc::now();
        let mut values = BTreeMap::new();
        values.insert("rsi14".to_string(), 55.5);
        values.insert("ema20".to_string(), 100.0);
        DecisionRequest {
            symbol: "BTCUSDT".to_string(),
            requested_at: now,
            last_price: 100.5,
            indicators: vec![IndicatorSet {
                symbol: "BTCUSDT".to_string(),
                timeframe: Timeframe::M3,
                as_of: now,
                values,
            }],
            position: Position::flat("BTCUSDT", now),
            balance: Balance {
                total: 10_000.0,
                available: 10_000.0,
                unrealized_pnl: 0.0,
                realized_pnl_today: 0.0,
                as_of: now,
            },
            margin: MarginHealth::default(),
            trade_history: vec![PastDecision {
                decided_at: now,
                action: Action::OpenLong,
                reasoning: "breakout above resistance".to_string(),
                order_status: Some(OrderStatus::Filled),
                fill_price: Some(99.5),
            }],
            risk_constraints: "Max position 5% of equity".to_string(),
        }
    }

    fn create_test_oracle(url: &str, max_retries: u32) -> LlmOracle {
        LlmOracle::new(&OracleConfig {
            provider: OracleProvider::Llm,
            base_url: url.to_string(),
            api_key: Some("sk-test".to_string()),
            max_retries,
            ..Default::default()
        })
        .unwrap()
    }

    fn completion(content: &str) -> String {
        serde_json::json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
            .to_string()
    }

    #[test]
    fn test_parse_fenced_json() {
        let text = "```json\n{\"action\":\"open_long\",\"position_size_usd\":1000,\"reasoning\":\"trend\",\"confidence\":0.8}\n```";
        let decision = parse_decision(text).unwrap();
        assert_eq!(decision.action, Action::OpenLong);
        assert_eq!(decision.size_hint, Some(1000.0));
        assert_eq!(decision.confidence, 0.8);
    }

    #[test]
    fn test_parse_keeps_unknown_action() {
        let decision =
            parse_decision(r#"Sure! {"action":"BUY","reasoning":"x","confidence":0.9}"#).unwrap();
        assert_eq!(decision.action, Action::Invalid("BUY".to_string()));
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(matches!(
            parse_decision("I think you should buy."),
            Err(OracleError::Malformed(_))
        ));
    }

    #[test]
    fn test_prompt_contains_context() {
        let prompt = build_prompt(&create_test_request());
        assert!(prompt.contains("BTCUSDT"));
        assert!(prompt.contains("[3m indicators"));
        assert!(prompt.contains("rsi14: 55.5"));
        assert!(prompt.contains("Max position 5% of equity"));
        assert!(prompt.contains("risk level LOW"));
        assert!(prompt.contains("OPEN_LONG (FILLED @ 99.500000): breakout above resistance"));
    }

    #[test]
    fn test_prompt_flags_liquidation_risk() {
        let mut request = create_test_request();
        request.balance.available = 1_000.0;
        request.margin = MarginHealth::from_balance(&request.balance);
        request.trade_history.clear();
        assert_eq!(request.margin.risk, MarginRisk::Critical);

        let prompt = build_prompt(&request);
        assert!(prompt.contains("Margin used: 9000.00 (90.0% of total), risk level CRITICAL, liquidation risk"));
        assert!(prompt.contains("[Recent decisions, newest first]\nNone"));
    }

    #[test]
    fn test_api_key_required() {
        assert!(LlmOracle::new(&OracleConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_decide_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(serde_json::json!({"model": "gpt-4o-mini"})))
            .with_status(200)
            .with_body(completion(
                r#"{"action":"OPEN_SHORT","position_size_usd":250,"stop_loss_price":105,"reasoning":"overbought","confidence":0.7}"#,
            ))
            .create_async()
            .await;

        let oracle = create_test_oracle(&server.url(), 0);
        let decision = oracle.decide(&create_test_request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(decision.action, Action::OpenShort);
        assert_eq!(decision.stop_loss, Some(105.0));
    }

    #[tokio::test]
    async fn test_rate_limit_retried() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body("slow down")
            .expect(2)
            .create_async()
            .await;

        let oracle = create_test_oracle(&server.url(), 1);
        let err = oracle.decide(&create_test_request()).await.unwrap_err();

        limited.assert_async().await;
        assert!(matches!(err, OracleError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let unauthorized = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body("bad key")
            .expect(1)
            .create_async()
            .await;

        let oracle = create_test_oracle(&server.url(), 3);
        assert!(oracle.decide(&create_test_request()).await.is_err());
        unauthorized.assert_async().await;
    }
}
