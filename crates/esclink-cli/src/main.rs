//! esclink - serial tools for ESC motor controllers
//!
//! Operator front end over `esclink-core`: scanning, test spins, LED
//! checks, firmware installation, and parameter provisioning. All protocol
//! logic lives in the core crate; this binary is argument parsing,
//! prompts, and progress rendering.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Ports => commands::ports::run(),
        Commands::Scan { link, json } => commands::scan::run(&link, json),
        Commands::Spin {
            link,
            id,
            power,
            rpm,
            timeout,
            skip_prompt,
            led_red,
            led_green,
            led_blue,
            cmd_rate,
        } => commands::spin::run(commands::spin::SpinArgs {
            link,
            id,
            power,
            rpm,
            timeout,
            skip_prompt,
            leds: [led_red > 0, led_green > 0, led_blue > 0],
            cmd_rate,
        }),
        Commands::Led { link } => commands::led::run(&link),
        Commands::UploadFirmware {
            link,
            firmware_file,
            id,
            bootloader_baud_rate,
            skip_firmware_reset,
        } => commands::upload_firmware::run(
            &link,
            &firmware_file,
            id,
            bootloader_baud_rate,
            skip_firmware_reset,
        ),
        Commands::UploadParams {
            link,
            params_file,
            filter,
        } => commands::upload_params::run(&link, &params_file, &filter),
        Commands::VerifyParams {
            link,
            num_escs,
            save_params,
        } => commands::verify_params::run(&link, num_escs, save_params),
    }
}
