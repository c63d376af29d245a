// SPDX-License-Identifier: MPL-2.0

use std::{path::PathBuf, process::exit, sync::Arc};

use clap::{ArgAction, ArgGroup, Parser};
use log::{error, LevelFilter};

use exfat_fsck::{
    dev::FileDev,
    fsck::{run_fsck, FSCK_EXIT_OPERATION_ERROR, FSCK_EXIT_SYNTAX_ERROR},
    RepairMode,
};

#[derive(Parser, Debug)]
#[command(
    name = "fsck.exfat",
    version,
    about = "Check and repair an exFAT filesystem",
    group(ArgGroup::new("repair_mode").multiple(false))
)]
struct Cli {
    /// Repair interactively
    #[arg(short = 'r', long = "repair", group = "repair_mode")]
    repair: bool,

    /// Repair without ask
    #[arg(short = 'y', long = "repair-yes", group = "repair_mode")]
    repair_yes: bool,

    /// No repair
    #[arg(short = 'n', long = "repair-no", group = "repair_mode")]
    repair_no: bool,

    /// Repair automatically
    #[arg(short = 'p', long = "repair-auto", group = "repair_mode")]
    repair_auto: bool,

    /// Repair automatically
    #[arg(short = 'a', group = "repair_mode", hide = true)]
    repair_auto_short: bool,

    /// Print debug
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Device or image to check
    device: PathBuf,
}

impl Cli {
    fn repair_mode(&self) -> RepairMode {
        if self.repair {
            RepairMode::Ask
        } else if self.repair_yes {
            RepairMode::Yes
        } else if self.repair_auto || self.repair_auto_short {
            RepairMode::Auto
        } else {
            RepairMode::No
        }
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => FSCK_EXIT_SYNTAX_ERROR,
            };
            let _ = err.print();
            exit(code);
        }
    };

    let level = match cli.verbose {
        0 => LevelFilter::Error,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .init();

    let mode = cli.repair_mode();
    let dev = match FileDev::open(&cli.device, mode.can_write()) {
        Ok(dev) => Arc::new(dev),
        Err(err) => {
            error!("failed to open {}. {}", cli.device.display(), err);
            exit(FSCK_EXIT_OPERATION_ERROR);
        }
    };

    exit(run_fsck(dev, &cli.device.display().to_string(), mode));
}
