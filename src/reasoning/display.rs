//! splits raw step text into an optional short title and a body.

use regex::Regex;
use std::sync::LazyLock;

/// colon-derived titles longer than this stay part of the body.
pub const MAX_TITLE_CHARS: usize = 24;

static COLON_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<label>[^:：]+?)\s*[:：](?P<rest>.*\S.*)$").expect("COLON_TITLE regex pattern is valid")
});

// "Step 3", "步骤3", "阶段2", "第2步", "1. ", "1、"
static STEP_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?i:step)\s*\d+|步骤\s*\d+|阶段\s*\d+|第\s*\d+\s*步|\d{1,3}(?:\.(?:\s|$)|、))")
        .expect("STEP_HEADING regex pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDisplay {
    pub body: String,
    pub title: Option<String>,
}

pub fn normalize_step_text(text: &str) -> StepDisplay {
    let sanitized = text.replace("\r\n", "\n").replace('\r', "\n");
    let sanitized = sanitized.trim();
    let (first, following) = match sanitized.split_once('\n') {
        Some((first, rest)) => (first.trim(), rest.trim()),
        None => (sanitized, ""),
    };

    if let Some(caps) = COLON_TITLE.captures(first) {
        let rest = caps["rest"].trim();
        // "https://..." is not a label
        if !rest.starts_with("//") {
            let label = caps["label"].trim();
            let body = join_body(rest, following);
            if label.chars().count() <= MAX_TITLE_CHARS {
                return StepDisplay { body, title: Some(label.to_string()) };
            }
            return untitled(sanitized);
        }
    }

    if let Some(m) = STEP_HEADING.find(first) {
        let inline = first[m.end()..]
            .trim_start_matches(|c: char| {
                c.is_whitespace() || matches!(c, ':' | '：' | '-' | '–' | '—' | '.' | '、')
            })
            .trim_end();
        let body = join_body(inline, following);
        if !body.is_empty() {
            return StepDisplay { body, title: Some(m.as_str().trim().to_string()) };
        }
    }

    untitled(sanitized)
}

fn untitled(text: &str) -> StepDisplay {
    StepDisplay { body: text.to_string(), title: None }
}

fn join_body(inline: &str, following: &str) -> String {
    match (inline.is_empty(), following.is_empty()) {
        (false, false) => format!("{inline}\n{following}"),
        (false, true) => inline.to_string(),
        (true, _) => following.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn titled(title: &str, body: &str) -> StepDisplay {
        StepDisplay { body: body.into(), title: Some(title.into()) }
    }

    #[test]
    fn step_heading_without_colon() {
        assert_eq!(
            normalize_step_text("Step 1 further detail"),
            titled("Step 1", "further detail")
        );
    }

    #[test]
    fn colon_label_becomes_title() {
        assert_eq!(
            normalize_step_text("Plan: gather sources\nthen compare"),
            titled("Plan", "gather sources\nthen compare")
        );
        assert_eq!(normalize_step_text("步骤1：分析问题"), titled("步骤1", "分析问题"));
    }

    #[test]
    fn long_colon_label_is_not_a_title() {
        let text = "this sentence is clearly too long to be a heading: and so on";
        assert_eq!(normalize_step_text(text), untitled(text));
    }

    #[test]
    fn colon_without_inline_remainder_is_not_a_title() {
        assert_eq!(normalize_step_text("Plan:\nfirst"), untitled("Plan:\nfirst"));
    }

    #[test]
    fn heading_with_bare_colon_falls_through() {
        assert_eq!(
            normalize_step_text("Step 2:\ncheck the inputs"),
            titled("Step 2", "check the inputs")
        );
        assert_eq!(normalize_step_text("步骤3：\n核对"), titled("步骤3", "核对"));
    }

    #[test]
    fn heading_with_body_on_following_lines() {
        assert_eq!(
            normalize_step_text("Step 2\r\ncheck the inputs\r\n"),
            titled("Step 2", "check the inputs")
        );
        assert_eq!(normalize_step_text("第3步 整理结果"), titled("第3步", "整理结果"));
        assert_eq!(normalize_step_text("2. compare"), titled("2.", "compare"));
        assert_eq!(normalize_step_text("阶段2、汇总"), titled("阶段2", "汇总"));
    }

    #[test]
    fn bare_heading_stays_body() {
        assert_eq!(normalize_step_text("  Step 4  "), untitled("Step 4"));
    }

    #[test]
    fn decimals_and_urls_are_not_headings() {
        assert_eq!(normalize_step_text("1.5 is the ratio"), untitled("1.5 is the ratio"));
        assert_eq!(
            normalize_step_text("https://example.com is down"),
            untitled("https://example.com is down")
        );
    }
}
