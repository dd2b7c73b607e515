/// How program output is matched against the expected answer.
///
/// Whitespace handling is ASCII-only; Unicode whitespace is treated as
/// ordinary bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display)]
pub enum ComparisonMode {
    /// Byte identity after normalizing CRLF to LF.
    #[default]
    Exact,
    /// Per-line comparison ignoring trailing spaces/tabs and trailing
    /// empty lines.
    TrimTrailingWs,
    /// Comparison after removing every ASCII whitespace byte.
    IgnoreAllWs,
}

pub fn compare(expected: &[u8], actual: &[u8], mode: ComparisonMode) -> bool {
    match mode {
        ComparisonMode::Exact => normalize_newlines(expected) == normalize_newlines(actual),
        ComparisonMode::TrimTrailingWs => trimmed_lines(expected) == trimmed_lines(actual),
        ComparisonMode::IgnoreAllWs => strip_whitespace(expected) == strip_whitespace(actual),
    }
}

fn normalize_newlines(data: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(data.len());
    let mut iter = data.iter().copied().peekable();
    while let Some(c) = iter.next() {
        if c == b'\r' && iter.peek() == Some(&b'\n') {
            continue;
        }
        res.push(c);
    }
    res
}

fn trimmed_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = data.split(|&c| c == b'\n').map(trim_line_end).collect();
    while lines.last() == Some(&&b""[..]) {
        lines.pop();
    }
    lines
}

fn trim_line_end(mut line: &[u8]) -> &[u8] {
    while let Some((&last, rest)) = line.split_last() {
        if matches!(last, b' ' | b'\t' | b'\r') {
            line = rest;
        } else {
            break;
        }
    }
    line
}

fn strip_whitespace(data: &[u8]) -> Vec<u8> {
    data.iter()
        .copied()
        .filter(|c| !c.is_ascii_whitespace())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use ComparisonMode::*;

    #[test]
    fn exact_matches_identical_bytes() {
        assert!(compare(b"1 2 3\n", b"1 2 3\n", Exact));
        assert!(compare(b"", b"", Exact));
        assert!(!compare(b"1 2 3\n", b"1 2 3", Exact));
        assert!(!compare(b"hello\n", b"hell\n", Exact));
        assert!(!compare(b"hello \n", b"hello\n", Exact));
    }

    #[test]
    fn exact_normalizes_line_endings() {
        assert!(compare(b"a\r\nb\r\n", b"a\nb\n", Exact));
        assert!(compare(b"a\nb\n", b"a\r\nb\r\n", Exact));
        // lone CR is not a line ending
        assert!(!compare(b"a\rb\n", b"a\nb\n", Exact));
    }

    #[test]
    fn trim_ignores_trailing_horizontal_whitespace() {
        assert!(compare(b"hello \n", b"hello\n", TrimTrailingWs));
        assert!(compare(b"hello\t\n", b"hello\n", TrimTrailingWs));
        assert!(!compare(b" hello\n", b"hello\n", TrimTrailingWs));
        assert!(!compare(b"hel lo\n", b"hello\n", TrimTrailingWs));
    }

    #[test]
    fn trim_ignores_trailing_empty_lines() {
        assert!(compare(b"a\nb\n", b"a\nb\n\n\n", TrimTrailingWs));
        assert!(compare(b"a\nb", b"a\nb\n", TrimTrailingWs));
        assert!(!compare(b"a\n\nb\n", b"a\nb\n", TrimTrailingWs));
    }

    #[test]
    fn ignore_all_whitespace_strips_everything() {
        assert!(compare(b"1 2 3\n", b"1\n2\n3", IgnoreAllWs));
        assert!(compare(b"a b\tc\n", b"abc", IgnoreAllWs));
        assert!(!compare(b"abc", b"abd", IgnoreAllWs));
    }

    #[test]
    fn comparison_is_pure() {
        let e = b"x y\r\n z \n".to_vec();
        let a = b"x y\n z\n".to_vec();
        for mode in [Exact, TrimTrailingWs, IgnoreAllWs] {
            let first = compare(&e, &a, mode);
            assert_eq!(compare(&e, &a, mode), first);
            assert!(compare(&e, &e, mode));
        }
    }
}
