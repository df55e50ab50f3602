use std::{path::PathBuf, str::FromStr};

use anyhow::{bail, Context, Result};
use clap::Parser;
use flash_attention::harness::{Harness, HarnessConfig, Suite};
use flash_attention::CpuFlashAttention;

fn main() {
    if let Err(err) = run() {
        eprintln!("attn-check failed: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Flash-attention correctness suites", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a harness config file (TOML or JSON)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "SUITE",
        default_value = "all",
        help = "Suite to run: dense, fp8, varlen, flex or all"
    )]
    suite: SuiteArg,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, value_name = "N", help = "Run at most N cases per suite")]
    max_cases: Option<usize>,

    #[arg(long, value_name = "PATH", help = "Markdown file receiving the results")]
    results: Option<PathBuf>,
}

#[derive(Debug, Clone)]
enum SuiteArg {
    All,
    One(Suite),
}

impl FromStr for SuiteArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        s.parse().map(Self::One)
    }
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HarnessConfig::default(),
    };
    config.apply_env_overrides();
    if !args.overrides.is_empty() {
        config = config.with_overrides(
            args.overrides
                .iter()
                .map(|o| (o.path.as_str(), o.value.as_str())),
        )?;
    }
    if let SuiteArg::One(suite) = args.suite {
        config.suites = vec![suite];
    }
    if let Some(max_cases) = args.max_cases {
        config.max_cases = Some(max_cases);
    }
    if let Some(results) = args.results {
        config.results_path = Some(results);
    }
    config.validate()?;
    log::debug!("harness config: {config:?}");

    let harness = Harness::new(CpuFlashAttention::new(), config)?;
    let reports = harness.run_all()?;

    let mut failed = 0;
    for report in &reports {
        println!("{}", report.summary());
        failed += report.failed();
    }
    if failed > 0 {
        bail!("{failed} case(s) failed");
    }
    Ok(())
}
