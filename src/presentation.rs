//! Client-side display of a streamed critique.

use base64::Engine;
use serde::Serialize;

use crate::score::ScoreCard;

/// Shown to the user whenever a submission fails, whatever the cause.
pub const FAILURE_MESSAGE: &str = "分析失败，请重试。";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum RequestState {
    #[default]
    Idle,
    Streaming,
    Done,
    Error(String),
}

impl RequestState {
    pub fn is_busy(&self) -> bool {
        matches!(self, RequestState::Streaming)
    }
}

/// Append-only text assembled from fragments in receipt order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CritiqueBuffer {
    text: String,
    fragments: usize,
}

impl CritiqueBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
        self.fragments += 1;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn render(&self) -> String {
        render_markdown(&self.text)
    }
}

/// Render the critique markdown for a terminal. Pure: the same input always
/// gives the same output, so re-rendering after every fragment is safe.
pub fn render_markdown(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len() + 64);
    for line in markdown.lines() {
        let trimmed = line.trim_start();
        if let Some(title) = trimmed.strip_prefix("### ") {
            out.push_str(&format!("\x1b[1m{}\x1b[0m", inline(title)));
        } else if let Some(title) = trimmed.strip_prefix("## ") {
            let title = inline(title);
            let underline = "═".repeat(title.chars().count().max(2));
            out.push_str(&format!("\x1b[1;35m{}\x1b[0m\n{}", title, underline));
        } else if let Some(title) = trimmed.strip_prefix("# ") {
            out.push_str(&format!("\x1b[1;4m{}\x1b[0m", inline(title)));
        } else if let Some(item) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
        {
            out.push_str(&format!("  • {}", inline(item)));
        } else {
            out.push_str(&inline(line));
        }
        out.push('\n');
    }
    out
}

/// `**bold**` to terminal bold. An unmatched `**` is left as typed, which is
/// what a half-received fragment looks like.
fn inline(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("**") {
        let after = &rest[start + 2..];
        match after.find("**") {
            Some(end) => {
                out.push_str(&rest[..start]);
                out.push_str("\x1b[1m");
                out.push_str(&after[..end]);
                out.push_str("\x1b[0m");
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

fn strip_markup(line: &str) -> String {
    let line = line.trim_start_matches('#').trim_start();
    let line = line
        .strip_prefix("- ")
        .map(|item| format!("• {}", item))
        .unwrap_or_else(|| line.to_string());
    line.replace("**", "")
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Lay out the canvas and the critique side by side in one SVG.
pub fn export_composite(
    canvas_png: &[u8],
    canvas_size: (u32, u32),
    critique: &str,
    scores: Option<&ScoreCard>,
) -> String {
    const PANEL_WIDTH: u32 = 520;
    const PADDING: u32 = 24;
    const LINE_HEIGHT: u32 = 26;

    let (canvas_w, canvas_h) = canvas_size;
    let mut lines: Vec<String> = Vec::new();
    if let Some(card) = scores {
        for (key, value) in &card.scores {
            lines.push(format!("{}: {:.1}", key, value));
        }
        lines.push(format!("average: {:.1}", card.average_score));
        lines.push(String::new());
    }
    lines.extend(critique.lines().map(strip_markup));

    let text_height = PADDING * 2 + LINE_HEIGHT * lines.len() as u32;
    let width = canvas_w + PANEL_WIDTH + PADDING * 3;
    let height = (canvas_h + PADDING * 2).max(text_height);
    let image = base64::prelude::BASE64_STANDARD.encode(canvas_png);

    let mut svg = format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">\n",
        w = width,
        h = height
    );
    svg.push_str(&format!(
        "  <rect width=\"{}\" height=\"{}\" fill=\"#ffffff\"/>\n",
        width, height
    ));
    svg.push_str(&format!(
        "  <image x=\"{p}\" y=\"{p}\" width=\"{}\" height=\"{}\" href=\"data:image/png;base64,{}\"/>\n",
        canvas_w,
        canvas_h,
        image,
        p = PADDING
    ));
    svg.push_str(&format!(
        "  <text x=\"{}\" y=\"{}\" font-family=\"serif\" font-size=\"16\" fill=\"#222222\">\n",
        canvas_w + PADDING * 2,
        PADDING
    ));
    for line in &lines {
        svg.push_str(&format!(
            "    <tspan x=\"{}\" dy=\"{}\">{}</tspan>\n",
            canvas_w + PADDING * 2,
            LINE_HEIGHT,
            escape_xml(line)
        ));
    }
    svg.push_str("  </text>\n</svg>\n");
    svg
}
