//! Headless fig-Forth engine running directly on a captured memory snapshot.
//!
//! The snapshot is the single source of truth: the dictionary, both stacks
//! and every system variable live inside it. The engine dispatches on code
//! field addresses instead of emulating the CPU underneath.

use std::path::PathBuf;

use clap::Parser;

pub mod console;
pub mod dictionary;
pub mod image;
pub mod machine;
pub mod opcode;
pub mod stack;
pub mod token;

#[cfg(test)]
mod testimage;

pub use crate::console::{BufferConsole, Console, StdConsole};
pub use crate::dictionary::{DictEntryRef, DictionaryIndex};
pub use crate::image::Snapshot;
pub use crate::machine::{Diagnostics, ForthMachine, MachineConfig, MachineState, RunMode};
pub use crate::opcode::{OpcodeTable, Primitive};
pub use crate::token::TokenSource;

#[derive(Debug, thiserror::Error)]
pub enum ForthError {
    #[error("cannot access {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot{} is {actual} bytes, expected {expected}", .path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    ImageSize {
        path: Option<PathBuf>,
        expected: usize,
        actual: usize,
    },
    #[error("dictionary chain is longer than {limit} entries")]
    DictionaryTooLong { limit: usize },
    #[error("no dictionary entry named {0:?}")]
    UnknownWord(String),
}

fn parse_addr(val: &str) -> clap::error::Result<u16> {
    let digits = val
        .strip_prefix("0x")
        .or_else(|| val.strip_prefix("0X"))
        .or_else(|| val.strip_prefix('$'))
        .unwrap_or(val);
    u16::from_str_radix(digits, 16)
        .map_err(|e| clap::error::Error::raw(clap::error::ErrorKind::ValueValidation, e))
}

// Accepts both signed and unsigned cells, e.g. -2 and 65534.
fn parse_cell(val: &str) -> clap::error::Result<u16> {
    val.parse::<i16>()
        .map(|n| n as u16)
        .or_else(|_| val.parse::<u16>())
        .map_err(|e| clap::error::Error::raw(clap::error::ErrorKind::ValueValidation, e))
}

#[derive(Parser)]
#[command(name = "snapforth")]
/// Run a fig-Forth snapshot without the machine it was captured on
///
/// With `--source` the Forth text is fed token by token to WORD; once the
/// file runs out, input continues from the console.
///
///     $ snapforth --snapshot base.sna --source test.f
///
/// A single word can be tried in isolation, seeding the stack first:
///
///     $ snapforth --word MAX --push 1 --push -2
struct CliArgs {
    /// Snapshot to load.
    #[arg(long, default_value = "base.sna")]
    snapshot: PathBuf,
    /// Forth source replayed through WORD.
    #[arg(long)]
    source: Option<PathBuf>,
    /// Where BYE writes the snapshot.
    #[arg(long, default_value = "wl_save.sna")]
    save: PathBuf,
    /// Address of the first threaded-code cell, in hex.
    #[arg(long, default_value = "7099", value_parser = parse_addr)]
    entry: u16,
    /// Run only this word and print the resulting stack.
    #[arg(long)]
    word: Option<String>,
    /// Cell pushed before running `--word`. May repeat.
    #[arg(long, value_parser = parse_cell, allow_negative_numbers = true)]
    push: Vec<u16>,
    /// Print the dictionary and exit.
    #[arg(long)]
    list_words: bool,
    /// Comma-separated `tracing` targets and levels, e.g. `warn,snapforth=trace`.
    #[arg(
        long = "trace",
        env = "SNAPFORTH_TRACE",
        default_value_t = tracing_subscriber::filter::Targets::new()
            .with_default(tracing::level_filters::LevelFilter::WARN),
    )]
    trace_filter: tracing_subscriber::filter::Targets,
}

/// What the binary should do once the machine is built.
pub enum Command {
    Run,
    RunWord { name: String, push: Vec<u16> },
    ListWords,
}

pub fn with_cli_args() -> Result<(ForthMachine, Command), ForthError> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let cli_args = CliArgs::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(cli_args.trace_filter)
        .init();
    let config = MachineConfig {
        entry: cli_args.entry,
        save_path: cli_args.save,
        ..MachineConfig::default()
    };
    let mut forth = ForthMachine::new(Snapshot::load(&cli_args.snapshot)?, config)?;
    if let Some(source) = cli_args.source {
        forth.load_source(source)?;
    }
    let command = if cli_args.list_words {
        Command::ListWords
    } else if let Some(name) = cli_args.word {
        Command::RunWord {
            name,
            push: cli_args.push,
        }
    } else {
        Command::Run
    };
    Ok((forth, command))
}

pub fn run(forth: &mut ForthMachine, command: Command) -> Result<(), ForthError> {
    match command {
        Command::Run => forth.run(RunMode::FreeRun),
        Command::RunWord { name, push } => run_word(forth, &name, &push),
        Command::ListWords => {
            list_words(forth);
            Ok(())
        }
    }
}

fn run_word(forth: &mut ForthMachine, name: &str, push: &[u16]) -> Result<(), ForthError> {
    let elements = forth.run_word(name, push)?;
    let cells: Vec<String> = elements.iter().map(|v| (*v as i16).to_string()).collect();
    println!("<{}> {}", cells.len(), cells.join(" "));
    let diagnostics = forth.diagnostics();
    if diagnostics.unknown_opcodes > 0 || diagnostics.stack_underflows > 0 {
        println!("{:?}", diagnostics);
    }
    Ok(())
}

fn list_words(forth: &ForthMachine) {
    let image = forth.image();
    for addr in forth.dictionary().entries() {
        let entry = DictEntryRef::new(image, *addr);
        let code = entry.code();
        let kind = match forth.opcodes().get(code) {
            Some(prim) => format!("{:?}", prim),
            None => String::from("-"),
        };
        println!(
            "{:#06x} {:<16} cfa {:#06x} code {:#06x} {}",
            addr,
            entry.name(),
            entry.code_field_addr(),
            code,
            kind
        );
    }
}

#[test]
fn test_parse_addr() {
    assert_eq!(parse_addr("7099").unwrap(), 0x7099);
    assert_eq!(parse_addr("0x9E4F").unwrap(), 0x9E4F);
    assert_eq!(parse_addr("$ffff").unwrap(), 0xFFFF);
    assert!(parse_addr("10000").is_err());
    assert!(parse_addr("zz").is_err());
}

#[test]
fn test_parse_cell() {
    assert_eq!(parse_cell("-2").unwrap(), 0xFFFE);
    assert_eq!(parse_cell("65535").unwrap(), 0xFFFF);
    assert_eq!(parse_cell("100").unwrap(), 100);
    assert!(parse_cell("65536").is_err());
}

#[test]
fn test_error_messages() {
    let err = ForthError::ImageSize {
        path: None,
        expected: 49179,
        actual: 3,
    };
    assert_eq!(err.to_string(), "snapshot is 3 bytes, expected 49179");
    let err = ForthError::ImageSize {
        path: Some(PathBuf::from("base.sna")),
        expected: 49179,
        actual: 3,
    };
    assert_eq!(err.to_string(), "snapshot base.sna is 3 bytes, expected 49179");
    assert_eq!(
        ForthError::UnknownWord("FOO".to_string()).to_string(),
        "no dictionary entry named \"FOO\""
    );
}
