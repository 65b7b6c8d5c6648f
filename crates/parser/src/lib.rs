//! `tether-parser` — incremental classification of model output.
//!
//! The model streams text containing tool invocations in a line-tag
//! syntax:
//!
//! ```text
//! Let me check that file.
//! <read_file>
//! <path>src/main.rs</path>
//! </read_file>
//! ```
//!
//! [`StreamParser`] owns an append-only buffer of everything the model
//! has produced this turn and derives an ordered list of
//! [`ContentBlock`]s from it. The buffer is turn-sized, so each
//! increment re-parses it from scratch with an explicit state machine
//! (Scanning / InToolBody / InParamBody) — no position bookkeeping
//! across pushes, no regexes.
//!
//! Guarantees the dispatcher relies on: at most the final block is
//! partial, and only an unclosed tool invocation ever is. A tool block
//! is marked complete exactly when its closing tag line arrives, so a
//! mid-stream invocation can never fire early.

use tether_domain::block::{ContentBlock, ToolParams};

/// Parser state, one buffer per model turn.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: String,
    blocks: Vec<ContentBlock>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment of model output and re-derive the block list.
    /// Fragment boundaries are arbitrary — mid-line, mid-tag, anywhere.
    pub fn push(&mut self, fragment: &str) -> &[ContentBlock] {
        self.buffer.push_str(fragment);
        self.reparse();
        &self.blocks
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        &self.blocks
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    fn reparse(&mut self) {
        let mut blocks = Vec::new();
        let mut text_lines: Vec<&str> = Vec::new();
        let mut state = State::Scanning;

        for raw in self.buffer.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            let trimmed = line.trim();

            state = match state {
                State::Scanning => match parse_open_tag(trimmed) {
                    // A tool opens only with a bare `<name>` line.
                    Some((name, "")) => {
                        flush_text(&mut blocks, &mut text_lines);
                        State::InToolBody {
                            tool: OpenTool::new(name),
                        }
                    }
                    _ => {
                        text_lines.push(line);
                        State::Scanning
                    }
                },

                State::InToolBody { mut tool } => {
                    if is_close_tag(trimmed, &tool.name) {
                        blocks.push(tool.into_block(false));
                        State::Scanning
                    } else if let Some((param, rest)) = parse_open_tag(trimmed) {
                        let param = param.to_string();
                        if rest.is_empty() {
                            State::InParamBody {
                                tool,
                                param,
                                value: String::new(),
                            }
                        } else if let Some(inline) = strip_close_suffix(rest, &param) {
                            // `<p>value</p>` on one line.
                            tool.params.push(param, inline);
                            State::InToolBody { tool }
                        } else {
                            // Value begins on the opening line and
                            // continues below.
                            let mut value = String::from(rest);
                            value.push('\n');
                            State::InParamBody { tool, param, value }
                        }
                    } else {
                        // Bare text between parameter tags carries no
                        // meaning in the invocation syntax; skipped.
                        State::InToolBody { tool }
                    }
                }

                State::InParamBody {
                    mut tool,
                    param,
                    mut value,
                } => {
                    if is_close_tag(trimmed, &param) {
                        tool.params.push(param, trim_trailing_newline(value));
                        State::InToolBody { tool }
                    } else if let Some(prefix) = strip_close_suffix(line, &param) {
                        value.push_str(prefix);
                        tool.params.push(param, value);
                        State::InToolBody { tool }
                    } else {
                        value.push_str(line);
                        value.push('\n');
                        State::InParamBody { tool, param, value }
                    }
                }
            };
        }

        // Whatever is still open when the buffer ends is the (single)
        // trailing partial block.
        match state {
            State::Scanning => flush_text(&mut blocks, &mut text_lines),
            State::InToolBody { tool } => blocks.push(tool.into_block(true)),
            State::InParamBody {
                mut tool,
                param,
                value,
            } => {
                tool.params.push(param, trim_trailing_newline(value));
                blocks.push(tool.into_block(true));
            }
        }

        self.blocks = blocks;
    }
}

enum State {
    Scanning,
    InToolBody {
        tool: OpenTool,
    },
    InParamBody {
        tool: OpenTool,
        param: String,
        value: String,
    },
}

struct OpenTool {
    name: String,
    params: ToolParams,
}

impl OpenTool {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: ToolParams::new(),
        }
    }

    fn into_block(self, partial: bool) -> ContentBlock {
        ContentBlock::ToolUse {
            name: self.name,
            params: self.params,
            partial,
        }
    }
}

/// `<name>rest` → `(name, rest)` for a line starting with an opening
/// tag. Close tags and non-tag lines return `None`.
fn parse_open_tag(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('<')?;
    if rest.starts_with('/') {
        return None;
    }
    let gt = rest.find('>')?;
    let name = &rest[..gt];
    if !is_valid_tag_name(name) {
        return None;
    }
    Some((name, &rest[gt + 1..]))
}

fn is_close_tag(line: &str, name: &str) -> bool {
    line.strip_prefix("</")
        .and_then(|rest| rest.strip_suffix('>'))
        .map(|n| n == name)
        .unwrap_or(false)
}

/// Strip a trailing `</name>` from a content line, returning what
/// precedes it.
fn strip_close_suffix<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_suffix('>')?
        .strip_suffix(name)?
        .strip_suffix("</")
}

fn is_valid_tag_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parameter lines are collected verbatim with a newline after each;
/// the visible value drops the final one.
fn trim_trailing_newline(mut value: String) -> String {
    if value.ends_with('\n') {
        value.pop();
    }
    value
}

fn flush_text(blocks: &mut Vec<ContentBlock>, lines: &mut Vec<&str>) {
    if lines.is_empty() {
        return;
    }
    let text = lines.join("\n");
    lines.clear();
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        blocks.push(ContentBlock::Text {
            text: trimmed.to_string(),
            partial: false,
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
