//! Turn execution — feeds the model's token stream through the parser
//! and runs at most one tool per turn.
//!
//! Each fragment is appended to the parser; whenever a tool invocation
//! completes it is dispatched immediately. The first invocation of the
//! turn wins — every later one is answered with a diagnostic instead
//! of being executed, keeping the one-tool-per-message contract even
//! when the model breaks it. A tool still partial when the stream ends
//! is never executed.

use futures_util::StreamExt;
use serde::Serialize;

use tether_domain::block::ContentBlock;
use tether_domain::stream::BoxStream;
use tether_parser::StreamParser;

use crate::dispatcher::Dispatcher;

/// Diagnostic returned for every tool invocation after the first in a
/// single turn.
pub const ONE_TOOL_PER_TURN: &str =
    "Only one tool may be used per message. This invocation was not executed; \
     wait for the previous tool result, then invoke the next tool in a new message.";

/// Record of one dispatched (or refused) tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub content: String,
    /// True when the invocation was refused by the one-tool-per-turn
    /// rule rather than executed.
    pub rejected: bool,
}

/// Everything a completed turn produced.
#[derive(Debug, Default)]
pub struct TurnOutcome {
    /// Final parsed blocks, in order.
    pub blocks: Vec<ContentBlock>,
    /// One entry per completed tool invocation, in order of appearance.
    pub tool_results: Vec<ToolResult>,
    /// Error carried by the token stream, if it failed mid-turn.
    pub stream_error: Option<String>,
}

impl TurnOutcome {
    /// Concatenated free text of the turn.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The result of the turn's executed tool, if one ran.
    pub fn executed_tool(&self) -> Option<&ToolResult> {
        self.tool_results.iter().find(|r| !r.rejected)
    }
}

/// Drive one model turn to completion.
pub async fn run_turn(
    dispatcher: &Dispatcher,
    mut stream: BoxStream<'_, tether_domain::error::Result<String>>,
) -> TurnOutcome {
    let mut parser = StreamParser::new();
    let mut outcome = TurnOutcome::default();
    let mut cursor = 0usize;
    let mut tool_used = false;

    while let Some(fragment) = stream.next().await {
        match fragment {
            Ok(text) => {
                parser.push(&text);
                drain_completed(
                    dispatcher,
                    &parser,
                    &mut cursor,
                    &mut tool_used,
                    &mut outcome.tool_results,
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "model stream failed mid-turn");
                outcome.stream_error = Some(e.to_string());
                break;
            }
        }
    }

    // End of stream: pick up anything the final fragment completed.
    drain_completed(
        dispatcher,
        &parser,
        &mut cursor,
        &mut tool_used,
        &mut outcome.tool_results,
    )
    .await;

    outcome.blocks = parser.blocks().to_vec();
    outcome
}

/// Walk newly finalized blocks in order, dispatching tool invocations.
/// Stops at the first partial block — only the trailing block can be
/// partial, and it may still change.
async fn drain_completed(
    dispatcher: &Dispatcher,
    parser: &StreamParser,
    cursor: &mut usize,
    tool_used: &mut bool,
    results: &mut Vec<ToolResult>,
) {
    let blocks = parser.blocks();
    while *cursor < blocks.len() {
        let block = &blocks[*cursor];
        if block.is_partial() {
            break;
        }
        if let ContentBlock::ToolUse { name, params, .. } = block {
            if *tool_used {
                tracing::warn!(tool = %name, "second tool invocation in one turn, refusing");
                results.push(ToolResult {
                    tool_name: name.clone(),
                    content: ONE_TOOL_PER_TURN.into(),
                    rejected: true,
                });
            } else {
                *tool_used = true;
                let content = dispatcher.dispatch(name, params).await;
                results.push(ToolResult {
                    tool_name: name.clone(),
                    content,
                    rejected: false,
                });
            }
        }
        *cursor += 1;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
