//! Line-oriented host for running a task in a plain terminal.

use std::io::{BufRead, Write};

use similar::TextDiff;

use crate::executor::EditPreview;
use crate::runtime::ApprovalSource;
use crate::task::{ApprovalKind, ApprovalRequest, ApprovalResponse, Presentation};

/// Prints task output to `output` and reads decisions from `input`.
///
/// Write failures are ignored; a closed input rejects whatever is pending.
pub struct ConsoleHost<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ConsoleHost<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    fn line(&mut self, text: &str) {
        let _ = writeln!(self.output, "{text}");
    }

    fn prompt(&mut self, text: &str) -> Option<String> {
        let _ = write!(self.output, "{text}");
        let _ = self.output.flush();

        let mut answer = String::new();
        match self.input.read_line(&mut answer) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(answer.trim().to_string()),
        }
    }
}

impl<R: BufRead, W: Write> ApprovalSource for ConsoleHost<R, W> {
    fn present(&mut self, presentation: &Presentation) {
        match presentation {
            Presentation::Narration { partial: true, .. } => {}
            Presentation::Narration { text, .. } => self.line(text),
            Presentation::Action {
                invocation,
                auto_approved,
                preview,
            } => {
                let marker = if *auto_approved { " (auto-approved)" } else { "" };
                self.line(&format!("> {}{marker}", invocation.describe()));
                if let Some(preview) = preview {
                    self.line(&render_preview(preview));
                }
            }
            Presentation::ActionResult {
                description,
                ok,
                text,
            } => {
                let status = if *ok { "ok" } else { "failed" };
                self.line(&format!("< {description} {status}"));
                if !*ok {
                    self.line(text);
                }
            }
            Presentation::IgnoredAction { description } => {
                self.line(&format!("- skipped {description}"));
            }
            Presentation::Notice { text } => self.line(&format!("! {text}")),
        }
    }

    fn decide(&mut self, request: &ApprovalRequest) -> ApprovalResponse {
        match request.kind {
            ApprovalKind::Action | ApprovalKind::RetryAfterFailure => {
                let question = match request.kind {
                    ApprovalKind::Action => format!("Run {}?", request.message),
                    _ => request.message.clone(),
                };
                match self.prompt(&format!("{question} [Y/n/feedback] ")) {
                    None => ApprovalResponse::rejected(),
                    Some(answer) => parse_decision(&answer),
                }
            }
            ApprovalKind::Followup => {
                self.line(&format!("? {}", request.message));
                for (index, option) in request.options.iter().enumerate() {
                    self.line(&format!("  {}. {option}", index + 1));
                }
                match self.prompt("answer> ") {
                    Some(answer) if !answer.is_empty() => {
                        let answer = pick_option(&answer, &request.options);
                        ApprovalResponse::message(answer)
                    }
                    _ => ApprovalResponse::rejected(),
                }
            }
            ApprovalKind::Completion => {
                self.line(&format!("= {}", request.message));
                match self.prompt("Press enter to accept, or type feedback: ") {
                    Some(answer) if !answer.is_empty() => ApprovalResponse::message(answer),
                    _ => ApprovalResponse::approved(),
                }
            }
        }
    }
}

fn parse_decision(answer: &str) -> ApprovalResponse {
    match answer.to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => ApprovalResponse::approved(),
        "n" | "no" => ApprovalResponse::rejected(),
        _ => ApprovalResponse::message(answer),
    }
}

/// A numeric answer selects the matching option.
fn pick_option(answer: &str, options: &[String]) -> String {
    answer
        .parse::<usize>()
        .ok()
        .and_then(|index| index.checked_sub(1))
        .and_then(|index| options.get(index))
        .cloned()
        .unwrap_or_else(|| answer.to_string())
}

fn render_preview(preview: &EditPreview) -> String {
    TextDiff::from_lines(&preview.original, &preview.proposed)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", preview.path), &format!("b/{}", preview.path))
        .to_string()
}
