//! Variable expansion (`$NAME`), run over each fully-parsed argument word.
use alloc::string::String;
use alloc::vec::Vec;

/// Expands every `$name` reference in `word` (`name` matching
/// `[A-Za-z0-9_]+`) by looking it up through `lookup`. A `$` not followed
/// by a name character, or a name `lookup` doesn't know, expands to the
/// empty string for that reference (matching a missing variable's `get`
/// returning empty).
pub fn expand(word: &str, mut lookup: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::new();
    let chars: Vec<char> = word.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                end += 1;
            }
            if end > start {
                let name: String = chars[start..end].iter().collect();
                if let Some(value) = lookup(&name) {
                    out.push_str(&value);
                }
                i = end;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_a_known_variable() {
        let out = expand("hello $NAME!", |n| (n == "NAME").then(|| "world".into()));
        assert_eq!(out, "hello world!");
    }

    #[test]
    fn unknown_variable_expands_to_empty() {
        let out = expand("[$MISSING]", |_| None);
        assert_eq!(out, "[]");
    }

    #[test]
    fn dollar_with_no_name_characters_is_left_as_is() {
        let out = expand("cost: $ ", |_| None);
        assert_eq!(out, "cost: $ ");
    }
}
