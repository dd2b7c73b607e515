use std::fmt;

/// Identifier of a testcase, unique within one run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TestcaseId {
    Num(u32),
    Name(String),
}

impl fmt::Display for TestcaseId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{}", n),
            Self::Name(s) => f.write_str(s),
        }
    }
}

impl From<u32> for TestcaseId {
    fn from(n: u32) -> Self {
        Self::Num(n)
    }
}

impl From<&str> for TestcaseId {
    fn from(s: &str) -> Self {
        Self::Name(s.to_owned())
    }
}

impl From<String> for TestcaseId {
    fn from(s: String) -> Self {
        Self::Name(s)
    }
}

/// One input/expected-output pair. `expected == None` means "run only,
/// do not check the output".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Testcase {
    pub id: TestcaseId,
    pub input: Vec<u8>,
    pub expected: Option<Vec<u8>>,
}

impl Testcase {
    pub fn new(
        id: impl Into<TestcaseId>,
        input: impl Into<Vec<u8>>,
        expected: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            expected: Some(expected.into()),
        }
    }

    pub fn run_only(id: impl Into<TestcaseId>, input: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            expected: None,
        }
    }
}

/// Testcases of one run, in admission order.
pub type TcTable = Vec<Testcase>;
