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
use clap::{Arg, ArgMatches, Command};
use ethfuzz::bytecode::{parse_hex_code, ValidJumpis};
use ethfuzz::codec::{self, DecodedInput};
use ethfuzz::ordering::{is_valid_order, parse_order};
use ethfuzz::utils::format_buffer_rows;
use ethfuzz::{ContractAbi, Dictionary, ExecutionOrder};
use std::fs;
use std::path::{Path, PathBuf};

fn read_code(path: &Path) -> anyhow::Result<Vec<u8>> {
    let s = fs::read_to_string(path)
        .with_context(|| format!("failed to read bytecode file {}", path.display()))?;
    parse_hex_code(&s).with_context(|| format!("invalid bytecode in {}", path.display()))
}

fn load_abi(matches: &ArgMatches) -> anyhow::Result<ContractAbi> {
    let path: &PathBuf = matches
        .get_one("abi")
        .ok_or_else(|| anyhow!("need to provide ABI_FILE --abi flag"))?;
    let name = match matches.value_of("name") {
        Some(n) => n.to_string(),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "contract".to_string()),
    };
    ContractAbi::load_from_file(&name, path)
}

fn load_code(matches: &ArgMatches) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let bin = match matches.get_one::<PathBuf>("bin") {
        Some(p) => read_code(p)?,
        None => bail!("need to provide BIN_FILE --bin flag"),
    };
    let bin_runtime = match matches.get_one::<PathBuf>("bin-runtime") {
        Some(p) => read_code(p)?,
        None => vec![],
    };
    anyhow::Result::Ok((bin, bin_runtime))
}

/// `--order 2->1->3`, defaults to declaration order
fn execution_order(matches: &ArgMatches, abi: &ContractAbi) -> anyhow::Result<ExecutionOrder> {
    let n = abi.function_count();
    match matches.value_of("order") {
        Some(text) => {
            let indices =
                parse_order(text).ok_or_else(|| anyhow!("could not parse order `{}`", text))?;
            is_valid_order(&indices, n)
                .ok_or_else(|| anyhow!("`{}` is not an order of {} functions", text, n))
        }
        None => Ok(ExecutionOrder::identity(n)),
    }
}

fn print_calls(abi: &ContractAbi, decoded: &DecodedInput) -> anyhow::Result<()> {
    let plan = codec::plan_decoded(abi, decoded)?;
    if !plan.constructor.is_empty() {
        println!("constructor: {}", hexutil::to_hex(&plan.constructor));
    }
    for call in plan.calls.iter() {
        println!(
            "{} (value {}): {}",
            call.name,
            call.value,
            hexutil::to_hex(&call.data)
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let order_arg = Arg::new("order")
        .long("order")
        .value_name("ORDER")
        .help("Execution order, e.g., 2->1->3")
        .takes_value(true);
    let app = Command::new(env!("CARGO_BIN_NAME"))
        .version(ethfuzz::VERSION)
        .about("Inspect contracts and fuzz buffers offline")
        .arg(
            Arg::new("abi")
                .short('a')
                .long("abi")
                .value_name("ABI_FILE")
                .help("Path to contract ABI definition file")
                .value_parser(clap::value_parser!(PathBuf))
                .takes_value(true),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .value_name("CONTRACT")
                .help("Contract name (default: ABI file stem)")
                .takes_value(true),
        )
        .arg(
            Arg::new("bin")
                .short('b')
                .long("bin")
                .value_name("BIN_FILE")
                .help("Path to the hex encoded deployment bytecode")
                .value_parser(clap::value_parser!(PathBuf))
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
        .subcommand_required(true)
        .subcommand(Command::new("functions").about("list fuzz target functions"))
        .subcommand(Command::new("events").about("list events and their topics"))
        .subcommand(
            Command::new("dict").about("dump the bytecode dictionary in AFL format"),
        )
        .subcommand(Command::new("jumpis").about("list the JUMPI program counters"))
        .subcommand(
            Command::new("seed")
                .about("print the seed buffer and the call-data it encodes")
                .arg(order_arg.clone()),
        )
        .subcommand(
            Command::new("decode")
                .about("decode a hex fuzz buffer")
                .arg(order_arg)
                .arg(
                    Arg::new("INPUT")
                        .help("hex encoded buffer")
                        .required(true)
                        .index(1),
                ),
        );
    let matches = app.get_matches();

    match matches.subcommand() {
        Some(("functions", _)) => {
            let abi = load_abi(&matches)?;
            abi.print_functions();
        }
        Some(("events", _)) => {
            let abi = load_abi(&matches)?;
            for e in abi.events() {
                println!("{} => {}", hexutil::to_hex(&e.topic()), e.signature());
            }
        }
        Some(("dict", _)) => {
            let (bin, bin_runtime) = load_code(&matches)?;
            let mut d = Dictionary::from_code(&bin);
            d.add_code(&bin_runtime);
            print!("{}", d.to_string());
        }
        Some(("jumpis", _)) => {
            let (bin, bin_runtime) = load_code(&matches)?;
            let jumpis = ValidJumpis::from_code(&bin, &bin_runtime);
            for pc in jumpis.deploy.iter() {
                println!("deploy  {}", pc);
            }
            for pc in jumpis.runtime.iter() {
                println!("runtime {}", pc);
            }
            println!("{} branches", jumpis.total_branches());
        }
        Some(("seed", sub)) => {
            let abi = load_abi(&matches)?;
            let order = execution_order(sub, &abi)?;
            let mut seed = codec::seed(&abi, &order)?;
            codec::postprocess(&mut seed);
            print!("{}", format_buffer_rows(&seed));
            let decoded = codec::decode(&abi, &order, &seed)?;
            print_calls(&abi, &decoded)?;
        }
        Some(("decode", sub)) => {
            let abi = load_abi(&matches)?;
            let order = execution_order(sub, &abi)?;
            let input = sub
                .value_of("INPUT")
                .ok_or_else(|| anyhow!("need to provide a hex buffer"))?;
            let data = parse_hex_code(input)?;
            let decoded = codec::decode(&abi, &order, &data)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&decoded.to_standard_json(&abi))?
            );
            print_calls(&abi, &decoded)?;
        }
        _ => bail!("unknown subcommand"),
    }

    anyhow::Result::Ok(())
}
