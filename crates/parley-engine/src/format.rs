//! Presentation pass applied to generated text before delivery.
//!
//! Only the delivered copy is decorated; history keeps the raw text.

use std::sync::LazyLock;

use regex::Regex;

/// Keyword → symbol, checked in this order.
const VOCABULARY: &[(&str, &str)] = &[
    ("recipe", "🍳"),
    ("ingredients", "🥕"),
    ("instructions", "📝"),
    ("steps", "👣"),
    ("step", "👣"),
    ("tip", "💡"),
    ("note", "📌"),
    ("warning", "⚠️"),
    ("important", "❗"),
    ("success", "✅"),
    ("time", "⏰"),
    ("temperature", "🌡️"),
    ("serving", "🍽️"),
];

static HEADER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#+\s*(.*)$").expect("valid regex"));
static LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z]+)(?:\s+\d+)?:\s*$").expect("valid regex"));
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Decorate markdown-ish text for display. Total: any input yields output.
pub fn decorate(text: &str) -> String {
    let lines: Vec<String> = text.split('\n').map(decorate_line).collect();
    BLANK_RUN.replace_all(&lines.join("\n"), "\n\n").into_owned()
}

fn decorate_line(line: &str) -> String {
    if let Some(caps) = HEADER.captures(line) {
        let title = &caps[1];
        let upper = title.to_uppercase();
        return match symbol_within(&title.to_lowercase()) {
            Some(sym) => format!("{sym} {upper} {sym}"),
            None => upper,
        };
    }

    if let Some(rest) = line.strip_prefix("* ") {
        return format!("• {rest}");
    }

    if let Some(caps) = LABEL.captures(line) {
        if let Some(sym) = symbol_for(&caps[1].to_lowercase()) {
            return format!("\n{sym} {line}");
        }
    }

    line.to_string()
}

/// First vocabulary symbol whose keyword occurs anywhere in `lowered`.
fn symbol_within(lowered: &str) -> Option<&'static str> {
    VOCABULARY
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword))
        .map(|(_, sym)| *sym)
}

fn symbol_for(word: &str) -> Option<&'static str> {
    VOCABULARY
        .iter()
        .find(|(keyword, _)| *keyword == word)
        .map(|(_, sym)| *sym)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_with_keyword() {
        assert_eq!(decorate("# recipe idea"), "🍳 RECIPE IDEA 🍳");
        assert_eq!(decorate("### Cooking Time"), "⏰ COOKING TIME ⏰");
    }

    #[test]
    fn header_first_keyword_wins() {
        assert_eq!(decorate("## Recipe Ingredients"), "🍳 RECIPE INGREDIENTS 🍳");
    }

    #[test]
    fn header_without_keyword_is_bare() {
        assert_eq!(decorate("## Overview"), "OVERVIEW");
        assert_eq!(decorate("#Summary"), "SUMMARY");
    }

    #[test]
    fn bullet_becomes_dot() {
        assert_eq!(decorate("* step one"), "• step one");
        assert_eq!(decorate("* a\n* b"), "• a\n• b");
    }

    #[test]
    fn bullet_requires_space() {
        assert_eq!(decorate("*emphasis*"), "*emphasis*");
        assert_eq!(decorate("  * indented"), "  * indented");
    }

    #[test]
    fn label_line_gets_symbol_and_spacing() {
        assert_eq!(decorate("Ingredients:"), "\n🥕 Ingredients:");
        assert_eq!(
            decorate("Intro\nTip:\nUse salt"),
            "Intro\n\n💡 Tip:\nUse salt"
        );
    }

    #[test]
    fn numbered_label() {
        assert_eq!(decorate("Step 2:"), "\n👣 Step 2:");
    }

    #[test]
    fn unknown_label_passes_through() {
        assert_eq!(decorate("Answer:"), "Answer:");
        assert_eq!(decorate("Note: remember this"), "Note: remember this");
    }

    #[test]
    fn blank_runs_collapse() {
        assert_eq!(decorate("a\n\n\nb"), "a\n\nb");
        assert_eq!(decorate("a\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(decorate("a\n\nb"), "a\n\nb");
    }

    #[test]
    fn label_after_blank_line_does_not_stack_blanks() {
        assert_eq!(decorate("Intro\n\nNote:"), "Intro\n\n📌 Note:");
    }

    #[test]
    fn plain_text_unchanged() {
        let text = "Hello there.\nThis is a plain answer with no markup.";
        assert_eq!(decorate(text), text);
        assert_eq!(decorate(""), "");
    }

    #[test]
    fn full_response() {
        let raw = "# Pancake Recipe\n\nIngredients:\n* flour\n* milk\n\n\n\nSteps:\n* mix\n* fry";
        let expected = "🍳 PANCAKE RECIPE 🍳\n\n🥕 Ingredients:\n• flour\n• milk\n\n👣 Steps:\n• mix\n• fry";
        assert_eq!(decorate(raw), expected);
    }
}
