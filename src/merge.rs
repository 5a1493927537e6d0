//! reconciles a previously seen text fragment with a newly arrived one.
//!
//! upstream providers emit true deltas and full restatements interchangeably,
//! so a plain append would duplicate the already-seen prefix on every
//! restatement.

/// merge `incoming` into `previous`, first matching rule wins:
///
/// 1. nothing seen yet -> `incoming`
/// 2. empty `incoming` -> `previous`
/// 3. identical -> no growth
/// 4. `incoming` restates `previous` plus a tail -> `incoming`
/// 5. `incoming` is a trailing echo of `previous` -> `previous`
/// 6. `previous` is a trailing echo of `incoming` -> `incoming`
/// 7. disjoint -> concatenated with a single `\n` separator
pub fn merge_content(previous: Option<&str>, incoming: &str) -> String {
    let previous = match previous {
        Some(p) if !p.is_empty() => p,
        _ => return incoming.to_string(),
    };
    if incoming.is_empty() || previous == incoming {
        return previous.to_string();
    }
    if incoming.starts_with(previous) {
        return incoming.to_string();
    }
    if previous.ends_with(incoming) {
        return previous.to_string();
    }
    if incoming.ends_with(previous) {
        return incoming.to_string();
    }

    let mut out = String::with_capacity(previous.len() + incoming.len() + 1);
    out.push_str(previous);
    if !previous.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(incoming);
    out
}

#[cfg(test)]
mod tests {
    use super::merge_content;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_previous_takes_incoming() {
        assert_eq!(merge_content(None, "abc"), "abc");
        assert_eq!(merge_content(Some(""), "abc"), "abc");
    }

    #[test]
    fn empty_incoming_keeps_previous() {
        assert_eq!(merge_content(Some("abc"), ""), "abc");
    }

    #[test]
    fn restatement_replaces_instead_of_appending() {
        assert_eq!(
            merge_content(Some("The answer is 4"), "The answer is 42"),
            "The answer is 42"
        );
    }

    #[test]
    fn trailing_echo_is_ignored() {
        assert_eq!(merge_content(Some("first part, second"), "second"), "first part, second");
    }

    #[test]
    fn inverse_echo_takes_incoming() {
        assert_eq!(merge_content(Some("world"), "hello world"), "hello world");
    }

    #[test]
    fn disjoint_fragments_join_on_newline() {
        assert_eq!(merge_content(Some("alpha"), "beta"), "alpha\nbeta");
        assert_eq!(merge_content(Some("alpha\n"), "beta"), "alpha\nbeta");
    }

    #[test]
    fn identical_does_not_grow() {
        assert_eq!(merge_content(Some("same"), "same"), "same");
    }

    #[test]
    fn non_ascii_prefix_is_handled() {
        assert_eq!(merge_content(Some("分析"), "分析中"), "分析中");
    }
}
