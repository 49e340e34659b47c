//! Runner for the URL test-corpus language.
//!
//! A corpus file is Markdown with fenced ```` ```test ```` blocks. Inside
//! a block each line is one command:
//!
//! - `ONLY libmapi` / `NOT libmapi`: scope the block by implementation
//! - `PARSE <url>`: parse into the current settings, then verify that
//!   the rendered URL round-trips
//! - `ACCEPT <url>`: parse, require validation to pass, round-trip
//! - `REJECT <url>`: require parsing or validation to fail
//! - `SET <key>=<value>`: set a named parameter
//! - `EXPECT <key>=<value>`: assert on a real or virtual parameter, or
//!   on `valid`
//!
//! Every block starts from default settings.

use std::path::Path;

use crate::settings::{parse_bool, Parm, ParmClass, ParmLookup, Settings, TlsVerify};
use crate::url::{parse_url, url_string, write_url};

/// The implementation tag `ONLY`/`NOT` match against.
const IMPLEMENTATION: &str = "libmapi";

/// A failed command, with `file:line` location.
#[derive(Debug)]
pub struct TestFailure {
    pub location: String,
    pub message: String,
}

impl std::fmt::Display for TestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

impl std::error::Error for TestFailure {}

struct Runner {
    filename: String,
    settings: Option<Settings>,
    start_line: usize,
    blocks_run: usize,
}

type TestResult = Result<(), String>;

pub fn run_file(path: &Path, verbose: u8) -> Result<usize, TestFailure> {
    let content = std::fs::read_to_string(path).map_err(|e| TestFailure {
        location: path.display().to_string(),
        message: e.to_string(),
    })?;
    run_content(&path.display().to_string(), &content, verbose)
}

/// Run all test blocks in `content`. Returns the number of blocks run.
pub fn run_content(filename: &str, content: &str, verbose: u8) -> Result<usize, TestFailure> {
    let mut runner = Runner {
        filename: filename.to_string(),
        settings: None,
        start_line: 0,
        blocks_run: 0,
    };
    for (lineno, line) in content.lines().enumerate() {
        let lineno = lineno + 1;
        if verbose >= 3 && runner.settings.is_some() {
            eprintln!("{line}");
        }
        runner
            .handle_line(lineno, line, verbose)
            .map_err(|message| TestFailure {
                location: format!("{filename}:{lineno}"),
                message,
            })?;
    }
    if runner.settings.is_some() {
        return Err(TestFailure {
            location: format!("{}:{}", runner.filename, runner.start_line),
            message: "unterminated code block starts here".to_string(),
        });
    }
    Ok(runner.blocks_run)
}

impl Runner {
    fn handle_line(&mut self, lineno: usize, line: &str, verbose: u8) -> TestResult {
        let line = line.trim_end();

        if self.settings.is_none() {
            // not in a code block
            if line == "```test" {
                self.blocks_run += 1;
                self.start_line = lineno;
                self.settings = Some(Settings::new());
                if verbose >= 2 {
                    eprintln!("{}:{lineno}", self.filename);
                }
            }
            return Ok(());
        }

        // in a code block: does it end here?
        if line.starts_with('`') {
            if line == "```" {
                self.settings = None;
                return Ok(());
            }
            return Err("unexpected backtick".to_string());
        }

        let Some(command) = line.split_whitespace().next() else {
            return Ok(()); // empty line
        };
        let rest = line[command.len()..].trim_start();

        // scope commands may end the block, handle them before borrowing it
        if command.eq_ignore_ascii_case("ONLY") || command.eq_ignore_ascii_case("NOT") {
            let Some(implementation) = rest.split_whitespace().next() else {
                return Err("syntax error".to_string());
            };
            let matches = implementation == IMPLEMENTATION;
            if (command.eq_ignore_ascii_case("ONLY") && !matches)
                || (command.eq_ignore_ascii_case("NOT") && matches)
            {
                self.settings = None;
            }
            return Ok(());
        }

        let settings = self.settings.as_mut().expect("inside a code block");

        match command.to_ascii_uppercase().as_str() {
            "PARSE" if !rest.is_empty() => {
                parse_url(settings, rest).map_err(|e| e.to_string())?;
                verify_roundtrip(settings)
            }
            "ACCEPT" if !rest.is_empty() => {
                parse_url(settings, rest).map_err(|e| e.to_string())?;
                settings
                    .validate()
                    .map_err(|e| format!("URL invalid: {e}"))?;
                verify_roundtrip(settings)
            }
            "REJECT" if !rest.is_empty() => {
                if parse_url(settings, rest).is_err() || settings.validate().is_err() {
                    Ok(())
                } else {
                    Err("expected URL to be rejected".to_string())
                }
            }
            "SET" if !rest.is_empty() => {
                let (key, value) = rest.split_once('=').unwrap_or((rest, ""));
                settings
                    .set_named(true, key, value)
                    .map_err(|e| e.to_string())?;
                if settings.validate().is_ok() {
                    verify_roundtrip(settings)
                } else {
                    Ok(())
                }
            }
            "EXPECT" if !rest.is_empty() => {
                let (key, value) = rest.split_once('=').unwrap_or((rest, ""));
                expect(settings, key, value)
            }
            _ if rest.is_empty()
                && matches!(
                    command.to_ascii_uppercase().as_str(),
                    "PARSE" | "ACCEPT" | "REJECT" | "SET" | "EXPECT"
                ) =>
            {
                Err("syntax error".to_string())
            }
            _ => Err(format!("unknown command: {command}")),
        }
    }
}

/// Render, reparse, compare every parameter, and check the truncation
/// contract of `write_url`.
fn verify_roundtrip(settings: &Settings) -> TestResult {
    let mut buffer = [0u8; 1000];
    let length = write_url(settings, &mut buffer);
    if length == 0 {
        return Err("write_url produced nothing".to_string());
    }
    if length > buffer.len() - 1 {
        return Err(format!("reconstructed URL unexpectedly large: {length}"));
    }
    let url = url_string(settings);
    debug_assert_eq!(url.as_bytes(), &buffer[..length]);

    let mut reparsed = Settings::new();
    parse_url(&mut reparsed, &url)
        .map_err(|e| format!("reconstructed URL <{url}> couldn't be parsed: {e}"))?;
    for parm in Parm::all() {
        let ours = settings.as_string(parm);
        let theirs = reparsed.as_string(parm);
        if ours != theirs {
            return Err(format!(
                "setting {}: reconstructed value <{theirs}> != <{ours}>",
                parm.name()
            ));
        }
    }

    // rendering into a smaller buffer returns the same length and writes
    // a NUL-terminated prefix
    for shorter in 1..=length {
        let mut small = vec![0xffu8; shorter];
        let n = write_url(settings, &mut small);
        if n != length {
            return Err(format!(
                "writing to buffer of size {shorter} returns {n}, expected {length}"
            ));
        }
        if small[shorter - 1] != 0 {
            return Err(format!("truncated <{shorter}> write_url didn't NUL terminate"));
        }
        if small[..shorter - 1] != buffer[..shorter - 1] {
            return Err(format!(
                "truncated <{shorter}> write_url didn't write a prefix of <{url}>"
            ));
        }
    }

    Ok(())
}

fn ensure_valid(settings: &mut Settings) -> Result<(), String> {
    settings
        .validate()
        .map_err(|e| format!("invalid parameter state: {e}"))
}

fn expect(settings: &mut Settings, key: &str, value: &str) -> TestResult {
    if key == "valid" {
        let expected =
            parse_bool(value).ok_or_else(|| format!("invalid boolean value: {value}"))?;
        let actually = settings.validate().is_ok();
        if actually != expected {
            return Err(format!("expected '{expected}', found '{actually}'"));
        }
        return Ok(());
    }

    // virtual parameters need a valid state
    match key {
        "connect_scan" => {
            let expected =
                parse_bool(value).ok_or_else(|| format!("invalid bool '{value}'"))?;
            ensure_valid(settings)?;
            return expect_eq(settings.connect_scan(), expected);
        }
        "connect_unix" => {
            ensure_valid(settings)?;
            return expect_eq(settings.connect_unix().to_string(), value.to_string());
        }
        "connect_tcp" => {
            ensure_valid(settings)?;
            return expect_eq(settings.connect_tcp().to_string(), value.to_string());
        }
        "connect_port" => {
            ensure_valid(settings)?;
            let expected: i64 = value
                .parse()
                .map_err(|_| format!("invalid integer '{value}'"))?;
            return expect_eq(settings.connect_port(), expected);
        }
        "connect_tls_verify" => {
            ensure_valid(settings)?;
            let actual = match settings.connect_tls_verify() {
                TlsVerify::None => "",
                TlsVerify::System => "system",
                TlsVerify::Cert => "cert",
                TlsVerify::Hash => "hash",
            };
            return expect_eq(actual.to_string(), value.to_string());
        }
        "connect_certhash_digits" => {
            ensure_valid(settings)?;
            return expect_eq(
                settings.connect_certhash_digits().to_string(),
                value.to_string(),
            );
        }
        "connect_binary" => {
            ensure_valid(settings)?;
            let expected: i64 = value
                .parse()
                .map_err(|_| format!("invalid integer '{value}'"))?;
            return expect_eq(settings.connect_binary(), expected);
        }
        "connect_clientkey" => {
            ensure_valid(settings)?;
            return expect_eq(settings.connect_clientkey().to_string(), value.to_string());
        }
        "connect_clientcert" => {
            ensure_valid(settings)?;
            return expect_eq(settings.connect_clientcert().to_string(), value.to_string());
        }
        _ => {}
    }

    let parm = match Parm::lookup(key) {
        ParmLookup::Known(parm) => parm,
        ParmLookup::Ignored if key.starts_with("connect_") => {
            return Err(format!("unknown virtual parameter '{key}'"));
        }
        ParmLookup::Ignored => {
            return Err("EXPECTing ignored parameters is not supported".to_string());
        }
        ParmLookup::Unknown => return Err(format!("unknown parameter '{key}'")),
    };

    match parm.classify() {
        ParmClass::Bool => {
            let expected =
                parse_bool(value).ok_or_else(|| format!("invalid bool '{value}'"))?;
            expect_eq(settings.get_bool(parm), expected)
        }
        ParmClass::Long => {
            let expected: i64 = value
                .parse()
                .map_err(|_| format!("invalid integer '{value}'"))?;
            expect_eq(settings.get_long(parm), expected)
        }
        ParmClass::String => expect_eq(settings.get_str(parm).to_string(), value.to_string()),
    }
}

fn expect_eq<T: PartialEq + std::fmt::Display>(actual: T, expected: T) -> TestResult {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected '{expected}', found '{actual}'"))
    }
}
