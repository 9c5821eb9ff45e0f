use super::process_harness::ProbeOutput;

/// One classified result line printed by a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLine {
    pub tcid: String,
    pub number: u32,
    pub kind: String,
    pub message: String,
}

impl ResultLine {
    /// Parses `<tcid> <number>  <KIND>  :  <message>`.
    pub fn parse(line: &str) -> Option<Self> {
        let (head, message) = line.split_once("  :  ")?;
        let mut fields = head.split_whitespace();
        let tcid = fields.next()?.to_string();
        let number = fields.next()?.parse().ok()?;
        let kind = fields.next()?.to_string();
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            tcid,
            number,
            kind,
            message: message.to_string(),
        })
    }
}

pub fn result_lines(output: &ProbeOutput) -> Vec<ResultLine> {
    output.stdout.lines().filter_map(ResultLine::parse).collect()
}

pub fn count_kind(output: &ProbeOutput, kind: &str) -> usize {
    result_lines(output).iter().filter(|l| l.kind == kind).count()
}

pub fn assert_exit_code(output: &ProbeOutput, expected: i32) {
    assert_eq!(
        output.code(),
        Some(expected),
        "unexpected exit status\nstdout:\n{}\nstderr:\n{}",
        output.stdout,
        output.stderr
    );
}

pub fn assert_stdout_contains(output: &ProbeOutput, needle: &str) {
    assert!(
        output.stdout.contains(needle),
        "expected {:?} in stdout:\n{}",
        needle,
        output.stdout
    );
}

#[test]
fn test_result_line_parse() {
    let line = ResultLine::parse("kprobe      3  PASS  :  getpid returned 42").unwrap();
    assert_eq!(line.tcid, "kprobe");
    assert_eq!(line.number, 3);
    assert_eq!(line.kind, "PASS");
    assert_eq!(line.message, "getpid returned 42");
    assert!(ResultLine::parse("Usage: kprobe [OPTIONS]").is_none());
}
