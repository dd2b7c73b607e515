use colored::{Color, ColoredString, Colorize};
use crossterm::terminal;
use tcrun_core::{ProcessOutcome, RunState, TestcaseId, TestcaseStatus};

pub fn status_label(status: TestcaseStatus) -> &'static str {
    use TestcaseStatus::*;
    match status {
        Waiting => "...",
        Running => "RUN",
        Passed => "AC",
        WrongAnswer => "WA",
        RuntimeError => "RE",
        TimedOut => "TLE",
        Cancelled => "CXL",
    }
}

pub fn status_color(status: TestcaseStatus) -> Color {
    use TestcaseStatus::*;
    match status {
        Passed => Color::Green,
        WrongAnswer => Color::Yellow,
        TimedOut => Color::Red,
        RuntimeError => Color::Magenta,
        Cancelled => Color::BrightBlack,
        Waiting | Running => Color::Blue,
    }
}

pub fn status_icon(status: TestcaseStatus) -> ColoredString {
    format!(" {} ", status_label(status))
        .on_color(status_color(status))
        .bold()
        .bright_white()
}

pub fn print_summary(state: &RunState) {
    let bar = "-".repeat(5);
    print!("{} ", bar);

    let total = state.statuses.len();
    let passed = state.count(TestcaseStatus::Passed);

    if passed == total {
        print!("{}", format!("{}/{} tests passed", passed, total).green());
    } else {
        let detail = [
            TestcaseStatus::WrongAnswer,
            TestcaseStatus::RuntimeError,
            TestcaseStatus::TimedOut,
            TestcaseStatus::Cancelled,
        ]
        .into_iter()
        .filter_map(|st| {
            let n = state.count(st);
            (n > 0).then(|| format!("{}{}{}", status_icon(st), "x".dimmed(), n))
        })
        .collect::<Vec<_>>()
        .join(", ");
        print!(
            "{} ({})",
            format!("{}/{} tests failed", total - passed, total).bright_red(),
            detail
        );
    }

    println!(" {}", bar);
}

pub fn print_testcase_detail(
    id: &TestcaseId,
    status: TestcaseStatus,
    expected: Option<&[u8]>,
    outcome: &ProcessOutcome,
) {
    let (cols, _) = terminal::size().unwrap_or((80, 24));
    let cols = cols as usize;
    let bold_bar = "━".repeat(cols).blue().bold();

    println!(
        "\n{}: {} [{}ms]{}\n{}",
        format!("Testcase {}", id).bright_yellow().bold(),
        status_icon(status),
        outcome.wall_time.as_millis(),
        if outcome.truncated {
            " (output truncated)".bright_red().to_string()
        } else {
            String::new()
        },
        bold_bar,
    );

    if let Some(expected) = expected {
        print_section("[expected]", expected, cols);
    }
    print_section("[stdout]", &outcome.stdout, cols);
    if !outcome.stderr.is_empty() {
        print_section("[stderr]", &outcome.stderr, cols);
    }

    println!("{}", bold_bar);
}

fn print_section(title: &str, data: &[u8], cols: usize) {
    println!(
        "{}{}",
        title.cyan().bold(),
        "─".repeat(cols.saturating_sub(title.len() + 1)).bright_black(),
    );
    if data.is_empty() {
        println!("{}", "<EMPTY>".magenta().dimmed());
        return;
    }
    let text = String::from_utf8_lossy(data);
    print!("{}", text);
    if !text.ends_with('\n') {
        println!("{}", " Missing newline ".on_yellow().black().bold());
    }
}
