use std::{ffi::OsStr, fs, path::Path};

use anyhow::Context as _;
use tcrun_core::{TcTable, Testcase, TestcaseId};

pub const INPUT_EXT: &str = "in";
pub const OUTPUT_EXT: &str = "out";

/// Enumerates `<name>.in` / `<name>.out` pairs under `dir` into a table,
/// ordered numerically where the names are numbers. A `.in` without a
/// matching `.out` becomes a run-only testcase.
pub fn load_testcase_dir(dir: impl AsRef<Path>) -> anyhow::Result<TcTable> {
    let dir = dir.as_ref();
    let entries =
        fs::read_dir(dir).with_context(|| format!("Cannot read testcase dir: {:?}", dir))?;

    let mut stems: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension() != Some(OsStr::new(INPUT_EXT)) {
                return None;
            }
            path.file_stem().map(|s| s.to_string_lossy().into_owned())
        })
        .collect();
    stems.sort_by_key(|stem| match stem.parse::<u32>() {
        Ok(n) => (0u8, n, stem.clone()),
        Err(_) => (1u8, 0, stem.clone()),
    });

    let mut table = Vec::with_capacity(stems.len());
    for stem in stems {
        let input_path = dir.join(format!("{}.{}", stem, INPUT_EXT));
        let output_path = dir.join(format!("{}.{}", stem, OUTPUT_EXT));
        let input = fs::read(&input_path)
            .with_context(|| format!("Cannot read testcase input: {:?}", input_path))?;
        let id = testcase_id(&stem);
        let testcase = if output_path.is_file() {
            let expected = fs::read(&output_path)
                .with_context(|| format!("Cannot read testcase output: {:?}", output_path))?;
            Testcase::new(id, input, expected)
        } else {
            Testcase::run_only(id, input)
        };
        table.push(testcase);
    }
    Ok(table)
}

fn testcase_id(stem: &str) -> TestcaseId {
    stem.parse::<u32>()
        .map(TestcaseId::Num)
        .unwrap_or_else(|_| TestcaseId::Name(stem.to_owned()))
}
