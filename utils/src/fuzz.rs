// Copyright 2021 Michael Rodler
// This file is part of ethfuzz.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

#[macro_use]
extern crate anyhow;
extern crate clap;
extern crate ethfuzz;

use anyhow::Context;
use clap::{Arg, Command};
use ethfuzz::advisor::{BoundedAdvisor, CommandAdvisor};
use ethfuzz::bytecode::parse_hex_code;
use ethfuzz::executor::ProcessExecutor;
use ethfuzz::logger::FileSink;
use ethfuzz::{ContractAbi, FuzzConfig, Fuzzer, Target};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn read_code(path: &Path) -> anyhow::Result<Vec<u8>> {
    let s = fs::read_to_string(path)
        .with_context(|| format!("failed to read bytecode file {}", path.display()))?;
    parse_hex_code(&s).with_context(|| format!("invalid bytecode in {}", path.display()))
}

fn init_logging(verbosity: u64) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let app = Command::new(env!("CARGO_BIN_NAME"))
        .version(ethfuzz::VERSION)
        .about("Coverage-guided fuzzing of smart contract transaction sequences")
        .arg(
            Arg::new("abi")
                .short('a')
                .long("abi")
                .value_name("ABI_FILE")
                .help("Path to contract ABI definition file")
                .value_parser(clap::value_parser!(PathBuf))
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::new("bin")
                .short('b')
                .long("bin")
                .value_name("BIN_FILE")
                .help("Path to the hex encoded deployment bytecode")
                .value_parser(clap::value_parser!(PathBuf))
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::new("bin-runtime")
                .long("bin-runtime")
                .value_name("BIN_FILE")
                .help("Path to the hex encoded runtime bytecode")
                .value_parser(clap::value_parser!(PathBuf))
                .takes_value(true),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .value_name("CONTRACT")
                .help("Contract name used in logs and the report file name (default: ABI file stem)")
                .takes_value(true),
        )
        .arg(
            Arg::new("executor")
                .short('e')
                .long("executor")
                .value_name("COMMAND")
                .help("Command line of the execution backend, split at whitespace")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::new("advisor")
                .long("advisor")
                .value_name("COMMAND")
                .help("Advisor command; called with the path of a prompt file")
                .value_parser(clap::value_parser!(PathBuf))
                .takes_value(true),
        )
        .arg(
            Arg::new("source")
                .long("source")
                .value_name("SOURCE_FILE")
                .help("Contract source code quoted in advisor prompts")
                .value_parser(clap::value_parser!(PathBuf))
                .takes_value(true),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("YAML_FILE")
                .help("Campaign configuration")
                .value_parser(clap::value_parser!(PathBuf))
                .takes_value(true),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .help("Campaign duration in seconds")
                .value_parser(clap::value_parser!(u64))
                .takes_value(true),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("SEED")
                .help("Seed of the random number generator")
                .value_parser(clap::value_parser!(u64))
                .takes_value(true),
        )
        .arg(
            Arg::new("max-execs")
                .long("max-execs")
                .value_name("N")
                .help("Stop after N executions")
                .value_parser(clap::value_parser!(u64))
                .takes_value(true),
        )
        .arg(
            Arg::new("random-order")
                .long("random-order")
                .help("Never ask the advisor for execution orders"),
        )
        .arg(
            Arg::new("dict")
                .long("dict")
                .value_name("DICT_FILE")
                .help("Additional AFL-format dictionary for the code dictionary")
                .value_parser(clap::value_parser!(PathBuf))
                .multiple_occurrences(true)
                .takes_value(true),
        )
        .arg(
            Arg::new("report-dir")
                .short('o')
                .long("report-dir")
                .value_name("DIR")
                .help("Directory for the coverage report")
                .value_parser(clap::value_parser!(PathBuf))
                .takes_value(true),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .multiple_occurrences(true)
                .help("Sets the level of verbosity"),
        );
    let matches = app.get_matches();

    init_logging(matches.occurrences_of("v"));

    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => FuzzConfig::load_from_file(path)?,
        None => FuzzConfig::default(),
    };
    if let Some(d) = matches.get_one::<u64>("duration") {
        config.duration = *d;
    }
    if let Some(s) = matches.get_one::<u64>("seed") {
        config.seed = *s;
    }
    if let Some(m) = matches.get_one::<u64>("max-execs") {
        config.max_execs = Some(*m);
    }
    if matches.is_present("random-order") {
        config.random_order = true;
    }
    if let Some(dir) = matches.get_one::<PathBuf>("report-dir") {
        config.report_dir = dir.clone();
    }
    if let Some(src) = matches.get_one::<PathBuf>("source") {
        config.source = Some(src.clone());
    }
    let config = config.with_env_overrides();

    let abi_path: &PathBuf = matches
        .get_one("abi")
        .ok_or_else(|| anyhow!("need to provide ABI_FILE --abi flag"))?;
    let name = match matches.value_of("name") {
        Some(n) => n.to_string(),
        None => abi_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "contract".to_string()),
    };
    let abi = ContractAbi::load_from_file(&name, abi_path)?;

    let bin_path: &PathBuf = matches
        .get_one("bin")
        .ok_or_else(|| anyhow!("need to provide BIN_FILE --bin flag"))?;
    let bin = read_code(bin_path)?;
    let bin_runtime = match matches.get_one::<PathBuf>("bin-runtime") {
        Some(path) => read_code(path)?,
        None => vec![],
    };

    let executor_cmd = matches
        .value_of("executor")
        .ok_or_else(|| anyhow!("need to provide an --executor command"))?;
    let argv: Vec<&str> = executor_cmd.split_whitespace().collect();
    let executor = ProcessExecutor::spawn(&argv, abi.event_map().clone())
        .with_context(|| format!("failed to start executor `{}`", executor_cmd))?;

    let advisor = match matches.get_one::<PathBuf>("advisor") {
        Some(cmd) => {
            let source = match config.source.as_ref() {
                Some(path) => fs::read_to_string(path)
                    .with_context(|| format!("failed to read contract source {}", path.display()))?,
                None => String::new(),
            };
            let inner = CommandAdvisor::new(cmd.clone(), config.advisor_timeout());
            Some(BoundedAdvisor::new(
                Box::new(inner),
                config.advisor_retries,
                source,
            ))
        }
        None => None,
    };

    let sink = FileSink::create(&config.log_dir)?;
    let target = Target {
        abi,
        bin,
        bin_runtime,
    };
    let mut fuzzer = Fuzzer::new(target, config, executor)?.with_sink(Box::new(sink));
    if let Some(advisor) = advisor {
        fuzzer = fuzzer.with_advisor(advisor);
    }
    if let Some(paths) = matches.get_many::<PathBuf>("dict") {
        for path in paths {
            fuzzer.dicts_mut().code.add_from_file(path)?;
        }
    }

    let (summary, path) = fuzzer.run()?;
    println!(
        "{}: covered {} of {} branches ({}%) with {} executions, report in {}",
        summary.reason,
        summary.report.covered_paths,
        summary.report.total_paths,
        summary.report.coverage,
        summary.report.total_execs,
        path.display()
    );
    if summary.reason.is_fatal() {
        // stops the executor before exiting
        drop(fuzzer);
        std::process::exit(2);
    }

    anyhow::Result::Ok(())
}
