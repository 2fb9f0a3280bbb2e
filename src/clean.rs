//! Message cleaning: HTML stripping, noise removal, and structural
//! sectioning of raw email bodies.
//!
//! Everything downstream (scoring, chunking, indexing) consumes the
//! [`CleanedMessage`] produced here, never the raw body.

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};

/// A message body split along its structural boundaries.
#[derive(Debug, Clone, Default)]
pub struct MessageSections {
    /// Opening salutation line, when one was detected.
    pub greeting: Option<String>,
    /// The substantive body with greeting/signature/quotes removed.
    pub main: String,
    pub signature: Option<String>,
    /// Quoted reply text (everything below the first quote marker).
    pub quoted: Option<String>,
    /// The full cleaned text before sectioning, for fallback chunking.
    pub full_text: String,
}

#[derive(Debug, Clone)]
pub struct CleanedMessage {
    /// Display name when the sender was `Name <addr>`, else the address.
    pub sender: String,
    /// Subject with reply/forward prefixes stripped.
    pub subject: String,
    pub sections: MessageSections,
}

/// Compiled pattern set for cleaning. Build once and share; compilation is
/// the expensive part, cleaning itself is allocation-bound.
pub struct MessageCleaner {
    html_block: Regex,
    html_tag: Regex,
    zero_width: Regex,
    marketing_line: Vec<Regex>,
    tracking_url: Regex,
    signature_marker: Regex,
    quote_marker: Regex,
    greeting_line: Regex,
    reply_prefix: Regex,
    sender_display: Regex,
    blank_runs: Regex,
}

impl MessageCleaner {
    pub fn new() -> Result<Self> {
        let ci = |pattern: &str| -> Result<Regex> {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("Failed to compile cleaner pattern: {pattern}"))
        };

        let marketing_line = [
            r"^\s*(?:unsubscribe|manage (?:your )?preferences|update (?:your )?preferences)\b.*$",
            r"^\s*(?:view|read) (?:this|it) (?:email )?in (?:your )?browser.*$",
            r"^\s*(?:©|\(c\)|copyright)\s+\d{4}.*$",
            r"^\s*you (?:are|'re) receiving this (?:email|message).*$",
            r"^\s*(?:privacy policy|terms (?:of (?:service|use))?)\s*(?:\|.*)?$",
            r"^\s*follow us on\b.*$",
            r"^\s*no longer want (?:to receive )?these emails.*$",
        ]
        .iter()
        .map(|p| ci(p))
        .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            html_block: ci(r"<(?:style|script|head)\b[^>]*>[\s\S]*?</(?:style|script|head)>")?,
            html_tag: ci(r"<[^>]+>")?,
            zero_width: Regex::new(r"[\u{200b}\u{200c}\u{200d}\u{feff}\u{00ad}]")
                .context("Failed to compile zero-width pattern")?,
            marketing_line,
            tracking_url: ci(
                r"https?://[^\s]*(?:utm_[a-z]+|click\.|track(?:ing)?\.|list-manage|mailchi\.mp|sendgrid\.net)[^\s]*",
            )?,
            signature_marker: ci(
                r"^\s*(?:--\s*$|—\s*$|best regards|kind regards|warm regards|regards,|sincerely|cheers,|thanks,|thank you,|sent from my)",
            )?,
            quote_marker: ci(
                r"^\s*(?:>|On .{0,120} wrote:|-{3,}\s*Original Message\s*-{3,}|From:\s.+@)",
            )?,
            greeting_line: ci(
                r"^\s*(?:hi|hello|hey|dear|good (?:morning|afternoon|evening))\b[^\n]{0,80}[,!:]?\s*$",
            )?,
            reply_prefix: ci(r"^\s*(?:re|fwd?|aw|sv)\s*:\s*")?,
            blank_runs: Regex::new(r"\n{3,}").context("Failed to compile blank-run pattern")?,
            sender_display: Regex::new(r#"^\s*"?([^"<]+?)"?\s*<[^>]+>\s*$"#)
                .context("Failed to compile sender pattern")?,
        })
    }

    /// Clean one raw message into sectioned text. Never fails on content;
    /// garbage in yields an empty `main`, which the quality gate rejects.
    pub fn clean(&self, sender: &str, subject: &str, body: &str) -> CleanedMessage {
        let text = self.clean_body(body);
        let sections = self.split_sections(&text);
        CleanedMessage {
            sender: self.clean_sender(sender),
            subject: self.clean_subject(subject),
            sections,
        }
    }

    /// Strip HTML, decode common entities, drop invisible characters and
    /// tracking URLs, and normalize whitespace.
    pub fn clean_body(&self, body: &str) -> String {
        let text = self.html_block.replace_all(body, " ");
        // Tags become newlines for block-ish elements so paragraph
        // boundaries survive the strip.
        let text = text
            .replace("</p>", "\n\n")
            .replace("</P>", "\n\n")
            .replace("<br>", "\n")
            .replace("<br/>", "\n")
            .replace("<br />", "\n")
            .replace("</div>", "\n");
        let text = self.html_tag.replace_all(&text, " ");
        let text = decode_entities(&text);
        let text = self.zero_width.replace_all(&text, "");
        let text = self.tracking_url.replace_all(&text, "");

        let mut kept = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim_end();
            if self
                .marketing_line
                .iter()
                .any(|re| re.is_match(trimmed))
            {
                continue;
            }
            kept.push(collapse_spaces(trimmed));
        }

        let joined = kept.join("\n");
        self.blank_runs.replace_all(&joined, "\n\n").trim().to_string()
    }

    fn split_sections(&self, text: &str) -> MessageSections {
        let mut sections = MessageSections {
            full_text: text.to_string(),
            ..Default::default()
        };
        if text.is_empty() {
            return sections;
        }

        let lines: Vec<&str> = text.lines().collect();

        // Quoted reply: everything from the first quote marker down.
        let quote_start = lines.iter().position(|l| self.quote_marker.is_match(l));
        let (own, quoted) = match quote_start {
            Some(i) if i > 0 => (&lines[..i], Some(&lines[i..])),
            // A message that is nothing but a quote keeps it as its body.
            _ => (&lines[..], None),
        };
        if let Some(q) = quoted {
            let q = q.join("\n").trim().to_string();
            if !q.is_empty() {
                sections.quoted = Some(q);
            }
        }

        // Signature: scan the tail of the author's own text.
        let sig_start = own
            .iter()
            .enumerate()
            .rev()
            .take(8)
            .find(|(_, l)| self.signature_marker.is_match(l))
            .map(|(i, _)| i);
        let (body_lines, sig) = match sig_start {
            Some(i) if i > 0 => (&own[..i], Some(&own[i..])),
            _ => (own, None),
        };
        if let Some(s) = sig {
            let s = s.join("\n").trim().to_string();
            if !s.is_empty() {
                sections.signature = Some(s);
            }
        }

        // Greeting: a salutation on the first non-blank line.
        let mut body_start = 0;
        for (i, line) in body_lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            if self.greeting_line.is_match(line) {
                sections.greeting = Some(line.trim().to_string());
                body_start = i + 1;
            }
            break;
        }

        sections.main = body_lines[body_start.min(body_lines.len())..]
            .join("\n")
            .trim()
            .to_string();
        sections
    }

    /// `"Ada Lovelace" <ada@example.com>` → `Ada Lovelace`.
    pub fn clean_sender(&self, sender: &str) -> String {
        if let Some(caps) = self.sender_display.captures(sender) {
            let name = caps[1].trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
        sender.trim().to_string()
    }

    /// Strips stacked `Re:` / `Fwd:` prefixes.
    pub fn clean_subject(&self, subject: &str) -> String {
        let mut s = subject.trim();
        loop {
            match self.reply_prefix.find(s) {
                Some(m) if m.start() == 0 => s = s[m.end()..].trim_start(),
                _ => break,
            }
        }
        s.to_string()
    }
}

fn collapse_spaces(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut last_space = false;
    for ch in line.chars() {
        if ch == ' ' || ch == '\t' {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim_end().to_string()
}

/// Decodes the handful of entities that actually show up in mail bodies.
fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&mdash;", "—")
        .replace("&ndash;", "–")
        .replace("&hellip;", "…")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleaner() -> MessageCleaner {
        MessageCleaner::new().unwrap()
    }

    #[test]
    fn strips_html_and_decodes_entities() {
        let c = cleaner();
        let out = c.clean_body(
            "<html><head><style>p{color:red}</style></head><body><p>Meeting at 3pm &amp; drinks after.</p></body></html>",
        );
        assert_eq!(out, "Meeting at 3pm & drinks after.");
    }

    #[test]
    fn br_tags_become_line_breaks() {
        let c = cleaner();
        let out = c.clean_body("line one<br>line two<br/>line three");
        assert_eq!(out, "line one\nline two\nline three");
    }

    #[test]
    fn removes_marketing_lines_and_tracking_urls() {
        let c = cleaner();
        let out = c.clean_body(
            "Here is the report you asked for.\nUnsubscribe from this list\nhttps://example.com/page?utm_source=news\nView this email in your browser",
        );
        assert!(out.contains("report you asked for"));
        assert!(!out.to_lowercase().contains("unsubscribe"));
        assert!(!out.contains("utm_source"));
        assert!(!out.to_lowercase().contains("browser"));
    }

    #[test]
    fn removes_zero_width_characters() {
        let c = cleaner();
        let out = c.clean_body("he\u{200b}llo wor\u{feff}ld");
        assert_eq!(out, "hello world");
    }

    #[test]
    fn sections_split_greeting_signature_quote() {
        let c = cleaner();
        let body = "Hi Alice,\n\nThe deploy went out this morning and the dashboards look stable.\nLet me know if anything regresses on your side.\n\nBest regards,\nBob\n\nOn Mon, Mar 3, 2025 Alice wrote:\n> Did the deploy go out?";
        let msg = c.clean(
            "Bob Smith <bob@example.com>",
            "Re: Re: Deploy",
            body,
        );
        assert_eq!(msg.sender, "Bob Smith");
        assert_eq!(msg.subject, "Deploy");
        assert_eq!(msg.sections.greeting.as_deref(), Some("Hi Alice,"));
        assert!(msg.sections.main.contains("deploy went out"));
        assert!(!msg.sections.main.contains("Best regards"));
        assert!(msg
            .sections
            .signature
            .as_deref()
            .unwrap()
            .contains("Best regards"));
        assert!(msg.sections.quoted.as_deref().unwrap().contains("wrote:"));
    }

    #[test]
    fn quote_only_message_keeps_quote_as_body() {
        let c = cleaner();
        let sections = c.clean("a@b.c", "s", "> only quoted text here").sections;
        assert!(sections.main.contains("only quoted text"));
        assert!(sections.quoted.is_none());
    }

    #[test]
    fn empty_body_yields_empty_sections() {
        let c = cleaner();
        let sections = c.clean("a@b.c", "s", "   \n  ").sections;
        assert!(sections.main.is_empty());
        assert!(sections.full_text.is_empty());
        assert!(sections.greeting.is_none());
    }

    #[test]
    fn clean_sender_plain_address_passes_through() {
        let c = cleaner();
        assert_eq!(c.clean_sender("ada@example.com"), "ada@example.com");
        assert_eq!(
            c.clean_sender("\"Lovelace, Ada\" <ada@example.com>"),
            "Lovelace, Ada"
        );
    }
}
