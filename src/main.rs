// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

mod config;

use std::path::Path;
use std::process;

use anyhow::{anyhow, Context};
use block::qed::header::BackingFormat;
use block::qed::{CheckResult, QedConfig, QedImage};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;

use crate::config::{CreateConfig, OpenConfig, CREATE_SYNTAX, OPEN_SYNTAX};

fn create_app() -> Command {
    let image = Arg::new("image")
        .help("Path to the QED image")
        .num_args(1)
        .required(true);
    let open = Arg::new("open")
        .long("open")
        .help(OPEN_SYNTAX)
        .num_args(1)
        .default_value("");

    Command::new("qed-img")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Create, inspect and check QED disk images.")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .global(true)
                .help("Sets the level of debugging output"),
        )
        .subcommand(
            Command::new("create")
                .about("Create a new image")
                .arg(image.clone())
                .arg(
                    Arg::new("options")
                        .help(CREATE_SYNTAX)
                        .num_args(1)
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("info")
                .about("Print image information")
                .arg(image.clone())
                .arg(open.clone())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print as JSON"),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Check the image tables for consistency")
                .arg(image.clone())
                .arg(open.clone())
                .arg(
                    Arg::new("repair")
                        .long("repair")
                        .action(ArgAction::SetTrue)
                        .help("Zero corrupt table entries"),
                ),
        )
        .subcommand(
            Command::new("rebase")
                .about("Change or remove the backing file, without copying data")
                .arg(image.clone())
                .arg(
                    Arg::new("backing")
                        .long("backing")
                        .help("New backing file, relative to the image. Removed if absent")
                        .num_args(1),
                )
                .arg(
                    Arg::new("backing-fmt")
                        .long("backing-fmt")
                        .help("Backing file format: raw|qed")
                        .num_args(1)
                        .requires("backing"),
                ),
        )
        .subcommand(
            Command::new("map")
                .about("Print allocated and unallocated extents")
                .arg(image)
                .arg(open),
        )
}

fn open_image(matches: &ArgMatches, read_only: bool) -> anyhow::Result<QedImage> {
    let path = image_path(matches);
    let config = match matches.get_one::<String>("open") {
        Some(open) => OpenConfig::parse(open, read_only)?,
        None => QedConfig {
            read_only,
            ..Default::default()
        },
    };
    QedImage::open_path(path, &config)
        .with_context(|| format!("Failed to open {}", path.display()))
}

fn image_path(matches: &ArgMatches) -> &Path {
    // Required by every subcommand.
    matches
        .get_one::<String>("image")
        .map(|s| Path::new(s.as_str()))
        .unwrap_or_else(|| Path::new(""))
}

fn create(matches: &ArgMatches) -> anyhow::Result<i32> {
    let path = image_path(matches);
    let options = matches
        .get_one::<String>("options")
        .map(String::as_str)
        .unwrap_or_default();
    let options = CreateConfig::parse(options)?;
    QedImage::create_path(path, &options)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(0)
}

fn info(matches: &ArgMatches) -> anyhow::Result<i32> {
    let image = open_image(matches, true)?;
    let info = image.info();
    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(0);
    }

    println!("image: {}", image_path(matches).display());
    println!("virtual size: {}", info.image_size);
    println!("file size: {}", info.file_size);
    println!("cluster size: {}", info.cluster_size);
    println!("table size: {}", info.table_size);
    if let Some(backing_file) = &info.backing_file {
        println!("backing file: {backing_file}");
        println!(
            "backing format: {}",
            info.backing_format.as_deref().unwrap_or("probed")
        );
    }
    println!("needs check: {}", info.needs_check);
    Ok(0)
}

fn print_check(result: &CheckResult) {
    println!("{} L2 tables, {} data clusters", result.l2_tables, result.data_clusters);
    if result.corruptions > 0 {
        println!(
            "{} corrupt table entries, {} repaired",
            result.corruptions, result.corruptions_fixed
        );
    }
    if result.duplicates > 0 {
        println!("{} clusters referenced more than once", result.duplicates);
    }
    if result.leaks > 0 {
        println!("{} leaked clusters", result.leaks);
    }
}

fn check(matches: &ArgMatches) -> anyhow::Result<i32> {
    let repair = matches.get_flag("repair");
    let mut image = open_image(matches, !repair)?;
    let result = image.check(repair).context("Image check failed")?;
    print_check(&result);
    image.close()?;

    if result.is_clean() {
        println!("No errors found");
        Ok(0)
    } else {
        Ok(1)
    }
}

fn rebase(matches: &ArgMatches) -> anyhow::Result<i32> {
    let path = image_path(matches);
    let config = QedConfig::default();
    // The current parent is not needed to rewrite the header.
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let disk = block::raw_sync::RawFileDiskSync::new(file, true);
    let mut image = QedImage::open(Box::new(disk), &config)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let backing = matches.get_one::<String>("backing").map(String::as_str);
    let format = matches
        .get_one::<String>("backing-fmt")
        .map(|fmt| fmt.parse::<BackingFormat>())
        .transpose()?;
    image
        .change_backing_file(backing, format)
        .context("Failed to change backing file")?;
    image.close()?;
    Ok(0)
}

fn map(matches: &ArgMatches) -> anyhow::Result<i32> {
    let mut image = open_image(matches, true)?;
    let size = image.image_size();

    println!("{:>20} {:>20}  state", "offset", "length");
    let mut pos = 0;
    let mut extent: Option<(u64, u64, bool)> = None;
    while pos < size {
        let (allocated, len) = image.is_allocated(pos, size - pos)?;
        if len == 0 {
            return Err(anyhow!("No progress mapping offset {pos:#x}"));
        }
        extent = match extent {
            Some((start, extent_len, state)) if state == allocated => {
                Some((start, extent_len + len, state))
            }
            Some((start, extent_len, state)) => {
                print_extent(start, extent_len, state);
                Some((pos, len, allocated))
            }
            None => Some((pos, len, allocated)),
        };
        pos += len;
    }
    if let Some((start, len, state)) = extent {
        print_extent(start, len, state);
    }
    Ok(0)
}

fn print_extent(start: u64, len: u64, allocated: bool) {
    let state = if allocated { "allocated" } else { "unallocated" };
    println!("{start:#20x} {len:#20x}  {state}");
}

fn run(matches: &ArgMatches) -> anyhow::Result<i32> {
    match matches.subcommand() {
        Some(("create", m)) => create(m),
        Some(("info", m)) => info(m),
        Some(("check", m)) => check(m),
        Some(("rebase", m)) => rebase(m),
        Some(("map", m)) => map(m),
        _ => Err(anyhow!("Unknown subcommand")),
    }
}

fn main() {
    let matches = create_app().get_matches();

    let level = match matches.get_count("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let code = match run(&matches) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            1
        }
    };
    process::exit(code);
}
