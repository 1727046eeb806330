//! Markdown -> `m.room.message` rendering.
//!
//! Raw HTML in the markdown is not passed through: it is emitted as escaped
//! text. Single newlines become `<br>` so multi-line notification bodies keep
//! their shape in clients.

use pulldown_cmark::{html, Event, Options, Parser};

use super::MessageContent;

/// `m.room.message` msgtype for relayed notifications.
pub const MSGTYPE_TEXT: &str = "m.text";

/// Matrix HTML format identifier.
pub const HTML_FORMAT: &str = "org.matrix.custom.html";

/// Render markdown into message content.
///
/// `formatted_body` is omitted when the rendering adds nothing beyond a
/// single paragraph of the same text.
pub fn render_markdown(markdown: &str) -> MessageContent {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);

    let parser = Parser::new_ext(markdown, options).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        Event::SoftBreak => Event::HardBreak,
        other => other,
    });

    let mut rendered = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut rendered, parser);
    let rendered = rendered.trim_end();

    let formatted = !is_plain_paragraph(rendered, markdown);

    MessageContent {
        msgtype: MSGTYPE_TEXT.to_string(),
        body: markdown.to_string(),
        format: formatted.then(|| HTML_FORMAT.to_string()),
        formatted_body: formatted.then(|| rendered.to_string()),
    }
}

fn is_plain_paragraph(rendered: &str, markdown: &str) -> bool {
    let Some(inner) = rendered
        .strip_prefix("<p>")
        .and_then(|rest| rest.strip_suffix("</p>"))
    else {
        return rendered.is_empty();
    };
    !inner.contains(['<', '&']) && inner == markdown.trim()
}
