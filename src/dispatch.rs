//! Running the tool calls of a finished assistant turn.

use crate::error::ChatError;
use crate::message::{Arguments, Message, ToolCall};
use crate::render::Renderer;
use crate::tools::ToolRegistry;

/// Invoke `calls` in order and return one tool-result message per call, in the same order.
///
/// An unregistered tool name fails the whole batch before anything runs. Tool failures and
/// unparseable arguments become error results the model gets to see.
pub async fn dispatch(
    calls: &[ToolCall],
    registry: &ToolRegistry,
    renderer: &mut dyn Renderer,
) -> Result<Vec<Message>, ChatError> {
    let resolved = calls
        .iter()
        .map(|call| {
            registry
                .resolve(&call.name)
                .map(|tool| (call, tool))
                .ok_or_else(|| ChatError::UnknownTool(call.name.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut results = Vec::with_capacity(resolved.len());
    for (call, tool) in resolved {
        renderer.panel("Tool Call", &describe(call));

        let result = match &call.arguments {
            Arguments::Invalid { raw, error } => {
                tracing::warn!(tool = %call.name, id = %call.id, %error, "not invoking tool: bad arguments");
                Message::tool_result(
                    call,
                    format!("invalid arguments for `{}`: {error}\nreceived: {raw}", call.name),
                    true,
                )
            }
            Arguments::Parsed(args) => {
                tracing::info!(tool = %tool.name(), id = %call.id, "invoking tool");
                match tool.invoke(args.clone()).await {
                    Ok(out) => Message::tool_result(call, out, false),
                    Err(e) => {
                        tracing::warn!(tool = %tool.name(), id = %call.id, error = %format!("{e:#}"), "tool failed");
                        Message::tool_result(call, format!("{e:#}"), true)
                    }
                }
            }
        };

        renderer.panel("Tool Result", &result.text());
        results.push(result);
    }
    Ok(results)
}

fn describe(call: &ToolCall) -> String {
    let args = match &call.arguments {
        Arguments::Parsed(v) => v.to_string(),
        Arguments::Invalid { raw, .. } => raw.clone(),
    };
    format!("{}({args}) id={}", call.name, call.id)
}
