//! Terminal rendering for streamed session updates.
//!
//! Output style:
//! - Agent text: purple model name `->` then the text, line-buffered so
//!   fenced code blocks and headings can be styled
//! - Thoughts: dimmed, first line only, truncated to 100 chars
//! - Tool calls: blue name `->` gray summary of the input
//! - Tool failures and rejections: red
//!
//! Everything goes to stdout except tool failures, which go to stderr.

use std::io::Write;

use colored::Colorize;
use serde_json::Value;

use crate::acp::tools::{ToolCall, ToolStatus};

/// Per-session render state.
pub struct Renderer {
    model: String,
    /// Whether the next text chunk starts a new `model ->` block.
    first_chunk: bool,
    line_buffer: String,
    in_code_block: bool,
}

impl Renderer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            first_chunk: true,
            line_buffer: String::new(),
            in_code_block: false,
        }
    }

    pub fn agent_text(&mut self, text: &str) {
        let text = if self.first_chunk {
            // No blank lines between the prefix and the first real content.
            let trimmed = text.trim_start();
            if trimmed.is_empty() {
                return;
            }
            print!("\n{} {} ", self.model.purple(), "->".dimmed());
            self.first_chunk = false;
            trimmed
        } else {
            text
        };

        self.line_buffer.push_str(text);
        while let Some(pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=pos).collect();
            let formatted = format_markdown_line(&line[..line.len() - 1], &mut self.in_code_block);
            println!("{formatted}");
        }
        flush_stdout();
    }

    pub fn thought(&self, text: &str) {
        let truncated = truncate_to_line(text, 100);
        if !truncated.is_empty() {
            println!("{}", truncated.dimmed());
        }
    }

    /// A tool call announced by the agent through `session/update`.
    pub fn tool_announced(&mut self, title: &str) {
        self.break_text();
        println!("{} {}", title.blue(), "->".dimmed());
    }

    /// A tool call the client is about to run.
    pub fn tool_call(&mut self, name: &str, input: &Value) {
        self.break_text();
        println!(
            "{} {} {}",
            name.blue(),
            "->".dimmed(),
            summarize_tool_input(input).bright_black()
        );
    }

    pub fn tool_finished(&mut self, call: &ToolCall) {
        match call.status {
            ToolStatus::Completed => {}
            ToolStatus::Rejected => {
                println!("  {} {}", "|".dimmed(), "rejected".yellow());
            }
            _ => {
                eprintln!(
                    "{} {} {}",
                    "ERROR".red(),
                    "->".dimmed(),
                    format!("{}: {}", call.name, call.result_text()).bright_red()
                );
            }
        }
    }

    /// End of a turn: flush any partial line.
    pub fn finish(&mut self) {
        self.flush_line_buffer();
        if !self.first_chunk {
            println!();
        }
        self.first_chunk = true;
        flush_stdout();
    }

    /// Close the current text block before tool output.
    fn break_text(&mut self) {
        let was_streaming = !self.first_chunk;
        self.flush_line_buffer();
        if was_streaming {
            println!();
        }
        self.first_chunk = true;
    }

    fn flush_line_buffer(&mut self) {
        if self.line_buffer.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.line_buffer);
        print!("{}", format_markdown_line(&line, &mut self.in_code_block));
        flush_stdout();
    }
}

/// First line of `s`, cut to `max_chars` characters with `...` appended.
pub fn truncate_to_line(s: &str, max_chars: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    if first_line.chars().count() > max_chars {
        let cut: String = first_line.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        first_line.to_string()
    }
}

/// One-line description of a tool input: the command or path when present.
pub fn summarize_tool_input(input: &Value) -> String {
    for key in ["command", "file_path", "path", "url", "query"] {
        if let Some(s) = input.get(key).and_then(Value::as_str) {
            return match key {
                "file_path" | "path" => shorten_path(s).to_string(),
                _ => truncate_to_line(s, 120),
            };
        }
    }
    match input {
        Value::Null => String::new(),
        Value::Object(map) if map.is_empty() => String::new(),
        other => truncate_to_line(&other.to_string(), 120),
    }
}

/// Last three components of a path.
fn shorten_path(path: &str) -> &str {
    let mut slashes = 0;
    for (i, c) in path.char_indices().rev() {
        if c == '/' {
            slashes += 1;
            if slashes == 3 {
                return &path[i + 1..];
            }
        }
    }
    path
}

/// Style one line of markdown: fences toggle a dimmed code block, headings
/// are bold, inline `code` is cyan.
pub fn format_markdown_line(line: &str, in_code_block: &mut bool) -> String {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        *in_code_block = !*in_code_block;
        return line.dimmed().to_string();
    }
    if *in_code_block {
        return line.bright_black().to_string();
    }
    if trimmed.starts_with('#') && trimmed.trim_start_matches('#').starts_with(' ') {
        return line.bold().to_string();
    }
    format_inline_code(line)
}

fn format_inline_code(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(start) = rest.find('`') {
        let Some(len) = rest[start + 1..].find('`') else {
            break;
        };
        let end = start + 1 + len;
        out.push_str(&rest[..start]);
        out.push_str(&rest[start..=end].cyan().to_string());
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Flush stdout, ignoring any I/O errors.
pub fn flush_stdout() {
    std::io::stdout().flush().ok();
}
