use std::{path::PathBuf, process::exit};

pub fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|e| {
        eprintln!("Cannot get current dir: {}", e);
        exit(1);
    })
}
