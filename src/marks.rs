use std::io::BufRead as _;
use std::path::Path;

/// Scans an importer-written marks file and returns the highest mark that is
/// part of the contiguous run starting at 1. A missing file yields 0.
pub(crate) fn last_valid_mark(path: &Path) -> u32 {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return 0,
    };
    let mut reader = std::io::BufReader::new(file);

    let mut prev_mark = 0;
    let mut lineno = 0;
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("failed to read marks file {path:?}: {e}");
                return 0;
            }
        }
        lineno += 1;

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        let Some(mark) = parse_marks_line(trimmed) else {
            tracing::error!("{path:?} line {lineno}: marks file corrupt?");
            return 0;
        };

        if mark == prev_mark {
            tracing::error!("{path:?} line {lineno}: marks file has duplicates");
            return 0;
        }
        if mark < prev_mark {
            tracing::error!("{path:?} line {lineno}: marks file not sorted");
            return 0;
        }

        if mark > prev_mark + 1 {
            break;
        }
        prev_mark = mark;
    }

    prev_mark
}

fn parse_marks_line(line: &[u8]) -> Option<u32> {
    let rem = line.strip_prefix(b":")?;
    let sp = rem.iter().position(|&b| b == b' ')?;
    let mark = std::str::from_utf8(&rem[..sp]).ok()?.parse().ok()?;
    (mark != 0).then_some(mark)
}

#[cfg(test)]
mod test {
    use super::{last_valid_mark, parse_marks_line};

    fn marks_file(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marks-test");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_parse_marks_line() {
        assert_eq!(parse_marks_line(b":1 abcd"), Some(1));
        assert_eq!(parse_marks_line(b":1048575 abcd"), Some(1048575));
        assert_eq!(parse_marks_line(b":0 abcd"), None);
        assert_eq!(parse_marks_line(b"1 abcd"), None);
        assert_eq!(parse_marks_line(b":x abcd"), None);
        assert_eq!(parse_marks_line(b":1"), None);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(last_valid_mark(&dir.path().join("no-such-file")), 0);
    }

    #[test]
    fn test_contiguous() {
        let (_dir, path) = marks_file(":1 a\n:2 b\n:3 c\n");
        assert_eq!(last_valid_mark(&path), 3);
    }

    #[test]
    fn test_blank_lines_tolerated() {
        let (_dir, path) = marks_file(":1 a\n\n:2 b\n");
        assert_eq!(last_valid_mark(&path), 2);
    }

    #[test]
    fn test_stops_at_gap() {
        let (_dir, path) = marks_file(":1 a\n:2 b\n:5 c\n:6 d\n");
        assert_eq!(last_valid_mark(&path), 2);
    }

    #[test]
    fn test_duplicate_is_corrupt() {
        let (_dir, path) = marks_file(":1 a\n:1 b\n");
        assert_eq!(last_valid_mark(&path), 0);
    }

    #[test]
    fn test_descending_is_corrupt() {
        let (_dir, path) = marks_file(":2 a\n:1 b\n");
        assert_eq!(last_valid_mark(&path), 0);
    }

    #[test]
    fn test_malformed_is_corrupt() {
        let (_dir, path) = marks_file(":1 a\ngarbage\n");
        assert_eq!(last_valid_mark(&path), 0);
    }
}
