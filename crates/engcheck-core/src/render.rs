// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Markdown → sanitized HTML for item descriptions.
//!
//! Raw HTML (block or inline) is re-emitted as escaped text and link/image
//! destinations are restricted to `http`, `https`, `mailto` and scheme-less
//! references. The markdown source itself is never retained.

use pulldown_cmark::{html, CowStr, Event, Options, Parser, Tag, TagEnd};
use serde::Serialize;
use std::fmt;

const ALLOWED_SCHEMES: [&str; 3] = ["http", "https", "mailto"];

/// HTML that has already passed through [`render_markdown`].
///
/// Only this module constructs it, so holding one is proof of sanitization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SanitizedHtml(String);

impl SanitizedHtml {
    /// Borrow the sanitized markup.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SanitizedHtml {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rendered description: display markup plus a plain-text projection for search.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Description {
    /// Sanitized HTML.
    pub html: SanitizedHtml,
    /// Whitespace-collapsed plain text.
    pub text: String,
}

/// Render markdown into a [`Description`].
pub fn render_markdown(src: &str) -> Description {
    let mut opts = Options::empty();
    opts.insert(Options::ENABLE_TABLES);
    opts.insert(Options::ENABLE_STRIKETHROUGH);
    opts.insert(Options::ENABLE_TASKLISTS);

    let events: Vec<Event<'_>> = Parser::new_ext(src, opts).map(sanitize_event).collect();

    let mut out = String::with_capacity(src.len() + src.len() / 2);
    html::push_html(&mut out, events.iter().cloned());

    Description {
        html: SanitizedHtml(out),
        text: plain_text(&events),
    }
}

fn sanitize_event(event: Event<'_>) -> Event<'_> {
    match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        Event::Start(Tag::Link {
            link_type,
            dest_url,
            title,
            id,
        }) => Event::Start(Tag::Link {
            link_type,
            dest_url: safe_url(dest_url),
            title,
            id,
        }),
        Event::Start(Tag::Image {
            link_type,
            dest_url,
            title,
            id,
        }) => Event::Start(Tag::Image {
            link_type,
            dest_url: safe_url(dest_url),
            title,
            id,
        }),
        other => other,
    }
}

fn safe_url(dest: CowStr<'_>) -> CowStr<'_> {
    // Browsers ignore embedded whitespace/control chars when parsing schemes.
    let compact: String = dest
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && !c.is_control())
        .collect();
    let scheme_end = compact.find(':');
    let path_start = compact.find(['/', '?', '#']);
    let scheme = match (scheme_end, path_start) {
        (Some(colon), Some(path)) if path < colon => None,
        (Some(colon), _) => Some(compact[..colon].to_ascii_lowercase()),
        (None, _) => None,
    };
    match scheme {
        Some(s) if !ALLOWED_SCHEMES.contains(&s.as_str()) => CowStr::Borrowed("#"),
        _ => dest,
    }
}

fn plain_text(events: &[Event<'_>]) -> String {
    let mut raw = String::new();
    for ev in events {
        match ev {
            Event::Text(t) | Event::Code(t) => raw.push_str(t),
            Event::SoftBreak | Event::HardBreak | Event::Rule => raw.push(' '),
            Event::End(
                TagEnd::Paragraph
                | TagEnd::Heading(_)
                | TagEnd::Item
                | TagEnd::TableCell
                | TagEnd::CodeBlock
                | TagEnd::HtmlBlock,
            ) => raw.push(' '),
            _ => {}
        }
    }
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
