//! 路由与聚合使用的 prompt 模板
//!
//! 路由 prompt 注入能力清单与决策 Schema；聚合 prompt 强制失败如实呈现规则。

use crate::oracle::decision::decision_schema_json;

/// 当前会话本地时间的文本形式（UTC + 会话分钟偏移，带偏移后缀）
pub fn local_now_string(utc_offset_minutes: i32) -> String {
    let local = chrono::Utc::now().naive_utc() + chrono::Duration::minutes(utc_offset_minutes as i64);
    let sign = if utc_offset_minutes < 0 { '-' } else { '+' };
    let abs = utc_offset_minutes.unsigned_abs();
    format!(
        "{} ({}{:02}:{:02} from UTC)",
        local.format("%A %Y-%m-%dT%H:%M:%S"),
        sign,
        abs / 60,
        abs % 60
    )
}

/// 路由决策的 system prompt
pub fn routing_prompt(manifest_json: &str, history_excerpt: &str, local_now: &str) -> String {
    let history_block = if history_excerpt.is_empty() {
        "(no prior turns)".to_string()
    } else {
        history_excerpt.to_string()
    };
    format!(
        r#"You are the routing brain of a personal assistant. Decide how to handle the user's request.

Current local datetime: {local_now}
Resolve relative dates (tomorrow, next Monday, tonight) against this datetime before filling parameters.

Available capability agents and their operations:
{manifest_json}

Recent conversation:
{history_block}

Rules:
- If the request is conversational (greeting, capability question, follow-up you can answer from history), answer directly: mode "direct" with a "reply".
- If the request needs a capability not listed above, use mode "unsupported" with a "reply" saying plainly what you cannot do.
- Otherwise propose one or more steps. Use only agents and operations listed above; never invent one.
- If a later step needs the output of an earlier step, set "depends_on_previous": true on the later step and reference prior results with "{{{{stepN.path.to.field}}}}" placeholders in its parameters (step numbering starts at step1).
- Independent requests in one message (e.g. weather AND news) are separate steps WITHOUT the dependency marker.
- Do not assume missing essential details (date, time, title); prefer asking via a direct reply.
- Only send email when the user explicitly asks to send; otherwise draft.
- Never guess. Always verify.

Respond with a single JSON object matching this schema, and nothing else:
{schema}"#,
        schema = decision_schema_json(),
    )
}

/// 聚合回复的 system prompt
pub fn synthesis_prompt(results_block: &str, notes_block: &str, local_now: &str) -> String {
    let notes = if notes_block.is_empty() {
        String::new()
    } else {
        format!("\nOrchestrator notes (mention these to the user in plain words):\n{notes_block}\n")
    };
    format!(
        r#"You are a personal assistant composing the final reply to the user.

Current local datetime: {local_now}

Structured results of the actions taken this turn:
{results_block}
{notes}
Rules:
- Write one coherent, friendly reply in natural language. Do not expose internal tool names, JSON or error codes.
- If any result has status "failed", say plainly what could not be done and why in user terms (e.g. "I couldn't access your calendar right now - please try again"). Never fabricate a success.
- If any result has status "partial", state what succeeded and what did not.
- For search results, cite titles and URLs.
- Be concise. End after answering; do not ask unnecessary follow-up questions."#,
    )
}

/// Oracle 不可用时的固定降级回复
pub const SERVICE_UNAVAILABLE_REPLY: &str =
    "I'm temporarily unable to process your request. Please try again in a moment.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_prompt_contains_manifest_and_schema() {
        let prompt = routing_prompt("[{\"agent\": \"weather\"}]", "", "2026-08-24T10:00:00+07:00");
        assert!(prompt.contains("\"agent\": \"weather\""));
        assert!(prompt.contains("depends_on_previous"));
        assert!(prompt.contains("{{stepN.path.to.field}}"));
        assert!(prompt.contains("(no prior turns)"));
    }

    #[test]
    fn test_local_now_string_applies_offset() {
        let s = local_now_string(420);
        assert!(s.contains("+07:00"));
        let s = local_now_string(-330);
        assert!(s.contains("-05:30"));
    }

    #[test]
    fn test_synthesis_prompt_surfaces_failure_rule() {
        let prompt = synthesis_prompt("[]", "", "2026-08-24T10:00:00+07:00");
        assert!(prompt.contains("Never fabricate a success"));
        assert!(prompt.contains("partial"));
    }
}
