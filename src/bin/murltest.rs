//! Run URL test-corpus files.
//!
//! Usage: `murltest [-v[v[v]]] TESTFILES..`

use std::path::Path;
use std::process::ExitCode;

use monetdb_mapi::urltest;

const USAGE: &str = "Usage: murltest TESTFILES..";

fn main() -> ExitCode {
    let mut verbose: u8 = 0;
    let mut files: Vec<String> = Vec::new();

    for arg in std::env::args().skip(1) {
        if !arg.starts_with('-') {
            files.push(arg);
            continue;
        }
        let flags = &arg[1..];
        if !flags.is_empty() && flags.chars().all(|c| c == 'v') {
            verbose += flags.len() as u8;
            continue;
        }
        eprintln!("invalid flag {arg}");
        eprintln!("{USAGE}");
        return ExitCode::from(1);
    }

    if files.is_empty() {
        eprintln!("{USAGE}");
        return ExitCode::from(1);
    }

    for file in &files {
        match urltest::run_file(Path::new(file), verbose) {
            Ok(blocks) => {
                if verbose >= 1 {
                    eprintln!("ran {blocks} successful tests from {file}");
                }
            }
            Err(failure) => {
                eprintln!("{failure}");
                return ExitCode::from(1);
            }
        }
    }
    ExitCode::SUCCESS
}
