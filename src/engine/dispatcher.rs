//! Tool call dispatch: validate, (re)plan, execute, normalize.
//!
//! One requested call passes through, in order: name lookup, policy check,
//! schema validation (with bounded LLM re-planning for extensions), timed
//! execution, and normalization into the uniform [`ToolCallResult`].

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::LoopConfig;
use crate::error::{ErrorCode, ToolError};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, ToolCall};
use crate::tools::policy::PolicyGate;
use crate::tools::registry::ToolRegistry;
use crate::tools::tool::{Tool, ToolCallResult, ToolContext, ToolKind};

/// Validates and executes one tool call at a time.
pub struct ToolCallDispatcher {
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyGate>,
    provider: Arc<dyn LlmProvider>,
    replan_attempts: u32,
}

impl ToolCallDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        policy: Arc<PolicyGate>,
        provider: Arc<dyn LlmProvider>,
        cfg: &LoopConfig,
    ) -> Self {
        Self {
            registry,
            policy,
            provider,
            replan_attempts: cfg.replan_attempts,
        }
    }

    /// Execute one requested call. Never returns `Err`: every failure is a
    /// normalized result the model can read.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolCallResult {
        let Some(tool) = self.registry.get(&call.name).await else {
            return ToolCallResult::error(
                ErrorCode::SkillNotFound,
                format!("tool '{}' is not available", call.name),
            );
        };

        if !self.policy.allowed(ctx.worker_id, &call.name).await {
            return ToolCallResult::error(
                ErrorCode::PolicyBlocked,
                format!("tool '{}' is blocked by policy", call.name),
            );
        }

        let mut args = call.arguments.clone();
        let schema = tool.parameters_schema();

        let mut attempts_left = if tool.kind() == ToolKind::Extension {
            self.replan_attempts
        } else {
            0
        };
        loop {
            match validate_args(&schema, &args) {
                Ok(()) => break,
                Err(validation) => {
                    if attempts_left == 0 {
                        let mut result = ToolCallResult::error(
                            ErrorCode::InvalidArgs,
                            format!("invalid arguments for '{}': {}", call.name, validation.reason),
                        );
                        result.missing_fields = validation.missing_fields;
                        return result;
                    }
                    attempts_left -= 1;
                    debug!(tool = %call.name, "Re-planning arguments after validation failure");
                    match self.replan_args(&tool, &args, &validation.reason).await {
                        Some(replanned) => args = replanned,
                        None => {
                            let mut result = ToolCallResult::error(
                                ErrorCode::InvalidArgs,
                                format!(
                                    "invalid arguments for '{}': {} (re-planning failed)",
                                    call.name, validation.reason
                                ),
                            );
                            result.missing_fields = validation.missing_fields;
                            return result;
                        }
                    }
                }
            }
        }

        let timeout = tool.execution_timeout();
        let executed = tokio::time::timeout(timeout, tool.execute(args, ctx)).await;
        match executed {
            Ok(Ok(value)) => ToolCallResult::from_value(value),
            Ok(Err(e)) => {
                warn!(tool = %call.name, "Tool failed: {e}");
                tool_error_result(&call.name, e)
            }
            Err(_) => ToolCallResult::error(
                ErrorCode::ExecutionTimeout,
                format!("tool '{}' timed out after {timeout:?}", call.name),
            ),
        }
    }

    /// Ask the model to repair invalid arguments, feeding back the validation
    /// error. Returns `None` when the reply is not parseable JSON.
    async fn replan_args(
        &self,
        tool: &Arc<dyn Tool>,
        bad_args: &serde_json::Value,
        reason: &str,
    ) -> Option<serde_json::Value> {
        let prompt = format!(
            "The arguments below for tool '{}' failed validation.\n\
             Schema: {}\n\
             Arguments: {}\n\
             Validation error: {}\n\
             Reply with ONLY the corrected arguments as a JSON object.",
            tool.name(),
            tool.parameters_schema(),
            bad_args,
            reason,
        );
        let request = CompletionRequest::new(vec![
            ChatMessage::system("You repair tool-call arguments. Output a single JSON object."),
            ChatMessage::user(prompt),
        ]);
        let response = self.provider.complete(request).await.ok()?;
        let text = response.text();
        parse_json_object(&text)
    }
}

/// Extract a JSON object from model output, tolerating surrounding prose or
/// code fences.
fn parse_json_object(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&trimmed[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

fn tool_error_result(name: &str, error: ToolError) -> ToolCallResult {
    let code = match &error {
        ToolError::NotFound { .. } => ErrorCode::SkillNotFound,
        ToolError::InvalidArgs { .. } => ErrorCode::InvalidArgs,
        ToolError::Timeout { .. } => ErrorCode::ExecutionTimeout,
        ToolError::NotAuthorized { .. } => ErrorCode::PolicyBlocked,
        ToolError::ExecutionFailed { .. } => ErrorCode::ExecutionError,
    };
    let message = match &error {
        // These variants may carry an empty name when raised by arg helpers.
        ToolError::InvalidArgs { reason, .. } => format!("invalid arguments for '{name}': {reason}"),
        other => other.to_string(),
    };
    ToolCallResult::error(code, message)
}

// ── Schema validation ───────────────────────────────────────────────

struct ValidationFailure {
    reason: String,
    missing_fields: Vec<String>,
}

/// Validate args against a JSON-Schema-like object: required fields present,
/// declared primitive types match. Unknown properties pass through.
fn validate_args(
    schema: &serde_json::Value,
    args: &serde_json::Value,
) -> Result<(), ValidationFailure> {
    let Some(args_map) = args.as_object() else {
        return Err(ValidationFailure {
            reason: "arguments must be a JSON object".to_string(),
            missing_fields: Vec::new(),
        });
    };

    let missing: Vec<String> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|required| {
            required
                .iter()
                .filter_map(|f| f.as_str())
                .filter(|f| !args_map.contains_key(*f))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if !missing.is_empty() {
        return Err(ValidationFailure {
            reason: format!("missing required fields: {}", missing.join(", ")),
            missing_fields: missing,
        });
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in args_map {
            let Some(declared) = properties.get(key).and_then(|p| p.get("type")) else {
                continue;
            };
            let Some(expected) = declared.as_str() else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(ValidationFailure {
                    reason: format!(
                        "field '{key}' should be {expected}, got {}",
                        json_type_name(value)
                    ),
                    missing_fields: Vec::new(),
                });
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string"},
                "count": {"type": "integer"},
                "deep": {"type": "boolean"}
            },
            "required": ["url"]
        })
    }

    #[test]
    fn missing_required_field_reported() {
        let err = validate_args(&schema(), &serde_json::json!({"count": 3})).unwrap_err();
        assert_eq!(err.missing_fields, vec!["url".to_string()]);
    }

    #[test]
    fn type_mismatch_rejected() {
        let err =
            validate_args(&schema(), &serde_json::json!({"url": "x", "count": "three"}))
                .unwrap_err();
        assert!(err.reason.contains("count"));
        assert!(err.missing_fields.is_empty());
    }

    #[test]
    fn valid_args_pass() {
        assert!(validate_args(
            &schema(),
            &serde_json::json!({"url": "https://example.com", "count": 2, "deep": true})
        )
        .is_ok());
    }

    #[test]
    fn unknown_properties_pass_through() {
        assert!(validate_args(&schema(), &serde_json::json!({"url": "x", "extra": 1})).is_ok());
    }

    #[test]
    fn non_object_args_rejected() {
        assert!(validate_args(&schema(), &serde_json::json!("just a string")).is_err());
    }

    #[test]
    fn parse_json_object_handles_fences() {
        let v = parse_json_object("Here you go:\n```json\n{\"url\": \"x\"}\n```").unwrap();
        assert_eq!(v["url"], "x");
        assert!(parse_json_object("no json here").is_none());
        assert!(parse_json_object("[1, 2, 3]").is_none());
    }
}
