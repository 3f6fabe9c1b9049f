/// Parses one progress-log line of the form
/// `progress SVN r<rev> branch <branch> = :<mark>`, with an optional
/// `#`-prefixed trailing comment. Other `progress` lines (branch reloads,
/// backups, tag announcements) and importer noise yield `None`.
pub(crate) fn parse_progress_line(line: &[u8]) -> Option<(u32, &str, u32)> {
    let mut rem = line;
    if let Some(hash) = rem.iter().position(|&b| b == b'#') {
        rem = &rem[..hash];
    }
    let rem = rem.trim_ascii();

    let rem = rem.strip_prefix(b"progress SVN r")?;
    let (revnum, rem) = take_number(rem)?;

    let rem = rem.strip_prefix(b" branch ")?;
    let eq = rem.windows(4).rposition(|w| w == b" = :")?;
    let branch = std::str::from_utf8(&rem[..eq]).ok()?;
    if branch.is_empty() {
        return None;
    }

    let (mark, rem) = take_number(&rem[(eq + 4)..])?;
    if !rem.is_empty() {
        return None;
    }

    Some((revnum, branch, mark))
}

fn take_number(slice: &[u8]) -> Option<(u32, &[u8])> {
    let len = slice
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(slice.len());
    if len == 0 {
        return None;
    }
    let number = std::str::from_utf8(&slice[..len]).ok()?.parse().ok()?;
    Some((number, &slice[len..]))
}

#[cfg(test)]
mod test {
    use super::parse_progress_line;

    #[test]
    fn test_parse_plain() {
        assert_eq!(
            parse_progress_line(b"progress SVN r3 branch master = :1\n"),
            Some((3, "master", 1)),
        );
    }

    #[test]
    fn test_parse_with_comment() {
        assert_eq!(
            parse_progress_line(b"progress SVN r5 branch b = :0 # from branch master at r3\n"),
            Some((5, "b", 0)),
        );
        assert_eq!(
            parse_progress_line(b"progress SVN r7 branch b = :0 # delete\n"),
            Some((7, "b", 0)),
        );
    }

    #[test]
    fn test_parse_branch_with_slash() {
        assert_eq!(
            parse_progress_line(b"progress SVN r12 branch releases/1.0 = :42\n"),
            Some((12, "releases/1.0", 42)),
        );
    }

    #[test]
    fn test_parse_surrounding_whitespace() {
        assert_eq!(
            parse_progress_line(b"  progress SVN r1 branch master = :1  \n"),
            Some((1, "master", 1)),
        );
    }

    #[test]
    fn test_other_progress_lines_ignored() {
        assert_eq!(
            parse_progress_line(b"progress Branch refs/heads/master reloaded\n"),
            None,
        );
        assert_eq!(
            parse_progress_line(b"progress Creating annotated tag v1 from ref refs/heads/master\n"),
            None,
        );
        assert_eq!(parse_progress_line(b"progress checkpoint\n"), None);
        assert_eq!(parse_progress_line(b"\n"), None);
        assert_eq!(parse_progress_line(b"commit refs/heads/master\n"), None);
    }

    #[test]
    fn test_malformed_numbers_ignored() {
        assert_eq!(parse_progress_line(b"progress SVN rX branch b = :1\n"), None);
        assert_eq!(parse_progress_line(b"progress SVN r1 branch b = :y\n"), None);
        assert_eq!(
            parse_progress_line(b"progress SVN r1 branch b = :1 trailing\n"),
            None,
        );
    }
}
