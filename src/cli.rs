//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use crawl_export::DEFAULT_CHUNK_SIZE;

/// Export the page table of a finished crawl as TSV.
///
/// Rows are fetched in chunks and appended to the output file. An interrupted
/// export resumes from the `.audisto_` checkpoint next to the output file.
#[derive(Parser, Debug)]
#[command(name = "crawl-export")]
#[command(author, version, about)]
pub struct Args {
    /// API username
    #[arg(short, long, value_parser = non_empty_trimmed)]
    pub username: String,

    /// API password
    #[arg(short, long, value_parser = non_empty_trimmed)]
    pub password: String,

    /// Crawl identifier
    #[arg(short, long, value_parser = parse_crawl_id)]
    pub crawl: u64,

    /// Request the reduced column set (deep=0)
    #[arg(short = 'd', long)]
    pub no_details: bool,

    /// Output file; rows go to stdout when omitted
    #[arg(short, long, value_parser = parse_output)]
    pub output: Option<PathBuf>,

    /// Start a new export instead of resuming an interrupted one
    #[arg(short = 'r', long)]
    pub no_resume: bool,

    /// Rows per request at the start of a new export
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, value_parser = clap::value_parser!(u64).range(1..))]
    pub chunk_size: u64,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Whether `deep=1` is requested.
    pub fn detail(&self) -> bool {
        !self.no_details
    }
}

fn non_empty_trimmed(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err("must not be empty".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

fn parse_crawl_id(value: &str) -> Result<u64, String> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err("crawl id must be greater than zero".to_string()),
        Ok(id) => Ok(id),
        Err(e) => Err(format!("invalid crawl id: {e}")),
    }
}

fn parse_output(value: &str) -> Result<PathBuf, String> {
    non_empty_trimmed(value).map(PathBuf::from)
}
