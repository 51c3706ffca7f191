/// Escapes MarkdownV2 special characters for regular text.
pub fn escape_md(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '_' | '*'
                | '['
                | ']'
                | '('
                | ')'
                | '~'
                | '`'
                | '>'
                | '#'
                | '+'
                | '-'
                | '='
                | '|'
                | '{'
                | '}'
                | '.'
                | '!'
                | '\\'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Inside a MarkdownV2 code span only backslash and backtick are special.
pub fn escape_md_code(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '`' || c == '\\' {
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
    fn escapes_markdown_specials() {
        assert_eq!(escape_md("a.b-c!"), "a\\.b\\-c\\!");
        assert_eq!(escape_md("plain"), "plain");
    }

    #[test]
    fn code_span_keeps_urls_readable() {
        assert_eq!(escape_md_code("ss://key#name"), "ss://key#name");
        assert_eq!(escape_md_code("a`b"), "a\\`b");
    }
}
