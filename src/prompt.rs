//! The default system prompt and the advisory system-prompt generator.

use crate::message::Message;
use crate::provider::{ChatRequest, Provider, ToolSpec};
use crate::render::Renderer;
use crate::stream::collect_turn;
use anyhow::Context;

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful assistant with access to external tools.

TOOL USAGE GUIDELINES:
- Use a tool whenever it would make your answer more accurate or more current, even if the user did not ask for it.
- Prefer tools over your built-in knowledge for recent events, facts that change over time, local information, and the current date or time.
- When a task needs several steps, call tools one after another and use each result to decide the next call.
- If a tool fails, read the error, fix the arguments if you can, and try again or explain what went wrong.

USER EXPERIENCE:
- Briefly say what you are looking up before calling a tool.
- After using a tool, cite where the information came from.
- For general knowledge you are confident about, answer directly.";

const OPEN_TAG: &str = "<SYSTEM_PROMPT>";
const CLOSE_TAG: &str = "</SYSTEM_PROMPT>";

/// Request text asking a model to write a system prompt for this tool catalogue.
pub fn generator_request(tools: &[ToolSpec]) -> String {
    let catalogue: Vec<serde_json::Value> = tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "args": t.input_schema.get("properties").cloned().unwrap_or(serde_json::Value::Null),
            })
        })
        .collect();
    let catalogue = serde_json::to_string_pretty(&catalogue).unwrap_or_else(|_| "[]".into());

    format!(
        "You are an expert in large language models and prompt design.

The user is building a general-purpose chat assistant that can call external tools, but the model does not call them when it should. \
For example, when asked \"Tell me how to make curry\" it answers from memory instead of searching the web first; it only searches when told to explicitly. \
The assistant should decide on its own which tool to call.

The following tools are defined:

<tool_definition>
{catalogue}
</tool_definition>

Write a system prompt that makes the model invoke these tools appropriately.
Wrap the system prompt in {OPEN_TAG}{CLOSE_TAG} tags.
Think step by step before responding."
    )
}

/// The text between the first `<SYSTEM_PROMPT>` tag pair, if the reply has one.
pub fn extract(reply: &str) -> Option<&str> {
    let start = reply.find(OPEN_TAG)? + OPEN_TAG.len();
    let end = reply[start..].find(CLOSE_TAG)? + start;
    let inner = reply[start..end].trim();
    (!inner.is_empty()).then_some(inner)
}

/// One tool-less model call that drafts a system prompt; falls back to the whole reply when the
/// model ignored the tags.
pub async fn generate(
    provider: &dyn Provider,
    model: &str,
    tools: &[ToolSpec],
    renderer: &mut dyn Renderer,
) -> anyhow::Result<String> {
    let history = [Message::user(generator_request(tools))];
    let req = ChatRequest::new(model, "", &history, Vec::new());
    let stream = provider
        .stream_chat(req)
        .await
        .context("provider failed to start streaming")?;
    let reply = collect_turn(provider.family(), stream, renderer).await?.text();
    Ok(extract(&reply).map(str::to_string).unwrap_or(reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::stub::StubProvider;
    use crate::render::testing::RecordingRenderer;
    use serde_json::json;

    #[test]
    fn extracts_tagged_section() {
        let reply = "Sure.\n<SYSTEM_PROMPT>\nAlways search first.\n</SYSTEM_PROMPT>\nGood luck.";
        assert_eq!(extract(reply), Some("Always search first."));
        assert_eq!(extract("no tags here"), None);
        assert_eq!(extract("<SYSTEM_PROMPT>unterminated"), None);
        assert_eq!(extract("<SYSTEM_PROMPT> </SYSTEM_PROMPT>"), None);
    }

    #[test]
    fn request_lists_the_tools() {
        let tools = vec![ToolSpec {
            name: "brave_web_search".into(),
            description: "Search the web".into(),
            input_schema: json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        }];
        let text = generator_request(&tools);
        assert!(text.contains("\"brave_web_search\""));
        assert!(text.contains("\"query\""));
        assert!(text.contains("<SYSTEM_PROMPT></SYSTEM_PROMPT>"));
    }

    #[tokio::test]
    async fn untagged_reply_is_returned_whole() {
        let stub = StubProvider::with_drip(std::time::Duration::ZERO);
        let mut r = RecordingRenderer::default();
        let out = generate(&stub, "stub", &[], &mut r).await.unwrap();
        assert!(out.starts_with("[stub] You said: You are an expert"));
    }
}
