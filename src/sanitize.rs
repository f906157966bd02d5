//! Reply sanitizer: removes leaked model reasoning, then strips or escapes
//! Markdown for Telegram delivery.
//!
//! Reasoning removal is an ordered list of independent rules. Each rule
//! either rewrites the whole text or leaves it alone; a rule that does not
//! apply never blocks the rules after it.

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

/// How model output is prepared for the chat platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatMode {
    /// Remove Markdown delimiters and send plain text.
    #[default]
    Strip,
    /// Backslash-escape MarkdownV2 reserved characters.
    Escape,
}

impl FormatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FormatMode::Strip => "strip",
            FormatMode::Escape => "escape",
        }
    }
}

/// One reasoning-removal heuristic.
///
/// `apply` returns `None` when the rule does not match; the pipeline keeps
/// the text unchanged and moves on to the next rule.
pub struct Rule {
    pub name: &'static str,
    apply: fn(&str) -> Option<String>,
}

/// Rules run in this order. Ordering matters: label splitting must run
/// before the line-level label cleanup, and paragraph excision before the
/// step/conclusion truncation.
pub const REASONING_RULES: &[Rule] = &[
    Rule { name: "think_tags", apply: strip_think_tags },
    Rule { name: "labeled_answer", apply: keep_labeled_answer },
    Rule { name: "thinking_preamble", apply: drop_thinking_preamble },
    Rule { name: "step_plan", apply: truncate_to_conclusion },
    Rule { name: "leading_labels", apply: strip_leading_labels },
    Rule { name: "analysis_leadin", apply: strip_analysis_leadin },
];

/// Strip any leaked internal-reasoning content and trim the result.
pub fn remove_reasoning(text: &str) -> String {
    let mut current = text.to_string();
    for rule in REASONING_RULES {
        if let Some(next) = (rule.apply)(&current) {
            current = next;
        }
    }
    current.trim().to_string()
}

/// Sanitize raw model output for display in the given mode.
pub fn sanitize(raw: &str, mode: FormatMode) -> String {
    let cleaned = remove_reasoning(raw);
    match mode {
        FormatMode::Strip => strip_markdown(&cleaned),
        FormatMode::Escape => escape_markdown(&cleaned),
    }
}

// ==================== reasoning rules ====================

/// Pre: text may contain literal `<think>` tags. Post: no such tags remain.
fn strip_think_tags(text: &str) -> Option<String> {
    if !text.contains("<think>") && !text.contains("</think>") {
        return None;
    }
    Some(text.replace("<think>", "").replace("</think>", ""))
}

/// Reasoning/answer label pairs, one per supported language.
const ANSWER_LABELS: &[(&str, &str)] = &[("Размышление:", "Ответ:"), ("Reasoning:", "Answer:")];

/// Pre: text contains both labels of a pair. Post: only the text after the
/// first answer label remains.
fn keep_labeled_answer(text: &str) -> Option<String> {
    let mut current: Option<String> = None;
    for (reasoning, answer) in ANSWER_LABELS {
        let view = current.as_deref().unwrap_or(text);
        if view.contains(reasoning) && view.contains(answer) {
            if let Some((_, rest)) = view.split_once(answer) {
                current = Some(rest.trim().to_string());
            }
        }
    }
    current
}

const THINKING_PHRASES: &[&str] = &[
    "Let me think through this",
    "Let me think about",
    "Let me reason through",
    "I'll think through",
    "Let's think about",
    "I need to think about",
    "Here's my thought process:",
    "My reasoning:",
    "Рассуждение:",
    "Ход мыслей:",
    "Давайте подумаем",
    "Я обдумаю",
];

/// Pre: some line contains a thinking-preamble phrase. Post: that line and
/// the lines up to the next blank line are gone; the blank line itself and
/// everything after it are kept.
fn drop_thinking_preamble(text: &str) -> Option<String> {
    for phrase in THINKING_PHRASES {
        if !text.contains(phrase) {
            continue;
        }
        let mut suppressing = false;
        let mut kept: Vec<&str> = Vec::new();
        for line in text.lines() {
            if !suppressing && line.contains(phrase) {
                suppressing = true;
                continue;
            }
            if suppressing && line.trim().is_empty() {
                suppressing = false;
            }
            if !suppressing {
                kept.push(line);
            }
        }
        if !kept.is_empty() {
            return Some(kept.join("\n"));
        }
    }
    None
}

const STEP_MARKERS: &[&str] = &["Step 1:", "Шаг 1:", "1.", "1)", "План:"];
const CONCLUSION_MARKERS: &[&str] = &[
    "Ответ:",
    "Answer:",
    "Итак,",
    "В итоге,",
    "Таким образом,",
    "Therefore,",
    "In conclusion,",
];

/// Pre: a step marker appears before a conclusion marker. Post: the text
/// starts at the conclusion marker (marker kept).
fn truncate_to_conclusion(text: &str) -> Option<String> {
    let mut current: Option<String> = None;
    for conclusion in CONCLUSION_MARKERS {
        let view = current.as_deref().unwrap_or(text);
        let Some(c_idx) = view.find(conclusion) else {
            continue;
        };
        for step in STEP_MARKERS {
            if view.find(step).is_some_and(|s_idx| s_idx < c_idx) {
                current = Some(view[c_idx..].to_string());
                break;
            }
        }
    }
    current
}

static LEADING_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:Размышления|Рассуждения|Thinking|Reasoning):\s*").unwrap()
});

/// Pre: lines may start with a bare reasoning label. Post: those labels are
/// removed, the rest of each line kept.
fn strip_leading_labels(text: &str) -> Option<String> {
    if !LEADING_LABEL_RE.is_match(text) {
        return None;
    }
    Some(LEADING_LABEL_RE.replace_all(text, "").into_owned())
}

static ANALYSIS_LEADIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:Позвольте мне проанализировать|Давайте разберем|Let me analyze|I'll analyze).*?\n",
    )
    .unwrap()
});

/// Pre: text contains an "let me analyze"-style lead-in line. Post: the
/// lead-in up to and including its newline is gone.
fn strip_analysis_leadin(text: &str) -> Option<String> {
    if !ANALYSIS_LEADIN_RE.is_match(text) {
        return None;
    }
    Some(ANALYSIS_LEADIN_RE.replace_all(text, "").into_owned())
}

// ==================== formatting ====================

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#+\s+").unwrap());
static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```(.*?)```").unwrap());

/// Remove Markdown delimiters, keeping the delimited text. Fenced code
/// blocks lose only the fences; unmatched delimiters are removed wherever
/// they appear rather than treated as errors.
pub fn strip_markdown(text: &str) -> String {
    let text = HEADING_RE.replace_all(text, "");
    let text = text.replace("**", "");
    let text = FENCE_RE.replace_all(&text, "$1");
    let text = text.replace('`', "");
    let text = text.replace('*', "");
    let text = text.replace('_', "");
    text.replace('~', "")
}

/// Characters reserved by Telegram MarkdownV2.
const ESCAPED_CHARS: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Single-pass escape of MarkdownV2 reserved characters. Not idempotent:
/// running it twice escapes the escapes.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    for c in text.chars() {
        if ESCAPED_CHARS.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_think_tags_removed() {
        assert_eq!(remove_reasoning("<think>hm</think>ok"), "hmok");
        assert_eq!(strip_think_tags("no tags here"), None);
    }

    #[test]
    fn test_labeled_answer_keeps_tail() {
        let out = sanitize("Reasoning: foo\nAnswer: bar", FormatMode::Strip);
        assert_eq!(out, "bar");
        let out = sanitize("Reasoning: foo\nAnswer: bar", FormatMode::Escape);
        assert_eq!(out, "bar");
    }

    #[test]
    fn test_labeled_answer_russian() {
        let out = remove_reasoning("Размышление: думаю...\nОтвет: привет");
        assert_eq!(out, "привет");
    }

    #[test]
    fn test_labeled_answer_requires_both_labels() {
        assert_eq!(keep_labeled_answer("Answer: just an answer"), None);
        assert_eq!(keep_labeled_answer("Reasoning: only reasoning"), None);
    }

    #[test]
    fn test_thinking_preamble_excised_until_blank_line() {
        let input = "Let me think about this.\nstep one\nstep two\n\nReal answer here.";
        let out = remove_reasoning(input);
        assert_eq!(out, "Real answer here.");
        assert!(!out.contains("step one"));
    }

    #[test]
    fn test_thinking_preamble_keeps_text_before_phrase() {
        let input = "Intro line.\nLet me think about it\nhidden\n\nkept";
        let out = remove_reasoning(input);
        assert!(out.starts_with("Intro line."));
        assert!(out.ends_with("kept"));
        assert!(!out.contains("hidden"));
    }

    #[test]
    fn test_step_plan_truncates_at_conclusion() {
        let input = "Step 1: do a thing\nStep 2: another\nTherefore, the sky is blue.";
        let out = remove_reasoning(input);
        assert_eq!(out, "Therefore, the sky is blue.");
    }

    #[test]
    fn test_step_plan_ignores_conclusion_before_steps() {
        // Conclusion marker first means nothing to cut.
        let input = "Итак, вот что вышло. 1. пункт";
        assert_eq!(truncate_to_conclusion(input), None);
    }

    #[test]
    fn test_leading_labels_stripped() {
        let out = remove_reasoning("Thinking: something\nplain line");
        assert_eq!(out, "something\nplain line");
    }

    #[test]
    fn test_analysis_leadin_removed() {
        let out = remove_reasoning("Let me analyze the question first.\nThe answer is 42.");
        assert_eq!(out, "The answer is 42.");
    }

    #[test]
    fn test_rule_failure_does_not_block_pipeline() {
        // Only the last rule applies; earlier non-matching rules pass through.
        let out = remove_reasoning("I'll analyze it quickly.\nDone.");
        assert_eq!(out, "Done.");
    }

    #[test]
    fn test_strip_bold_and_code() {
        assert_eq!(sanitize("**bold** and `code`", FormatMode::Strip), "bold and code");
    }

    #[test]
    fn test_strip_headings_and_emphasis() {
        let out = strip_markdown("# Title\nsome *em* _u_ ~s~ text");
        assert_eq!(out, "Title\nsome em u s text");
    }

    #[test]
    fn test_strip_fence_keeps_contents() {
        let out = strip_markdown("before\n```\nlet x = 1;\n```\nafter");
        assert!(out.contains("let x = 1;"));
        assert!(!out.contains("```"));
    }

    #[test]
    fn test_strip_is_idempotent() {
        let inputs = [
            "# Title\n**bold** `code` *em* _u_ ~s~",
            "plain text, no markup",
            "```rust\nfn main() {}\n```",
        ];
        for input in inputs {
            let once = sanitize(input, FormatMode::Strip);
            let twice = sanitize(&once, FormatMode::Strip);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_escape_every_reserved_char_once() {
        let input: String = ESCAPED_CHARS.iter().collect();
        let out = escape_markdown(&input);
        for c in ESCAPED_CHARS {
            let escaped = format!("\\{c}");
            assert!(out.contains(&escaped), "missing escape for {c:?}");
        }
        // One backslash per reserved character, single pass.
        assert_eq!(out.matches('\\').count(), ESCAPED_CHARS.len());
    }

    #[test]
    fn test_escape_leaves_plain_text_alone() {
        assert_eq!(escape_markdown("привет мир"), "привет мир");
    }

    #[test]
    fn test_unmatched_formatting_passes_through() {
        // A lone fence never matches the pair regex; strip still removes the
        // backticks themselves, escape keeps the text readable.
        let out = sanitize("broken ```fence", FormatMode::Strip);
        assert_eq!(out, "broken fence");
    }

    #[test]
    fn test_sanitize_trims_whitespace() {
        assert_eq!(sanitize("  hi there \n", FormatMode::Strip), "hi there");
    }
}
