//! Command-line interface definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// esclink - serial tools for ESC motor controllers
#[derive(Parser)]
#[command(name = "esclink", version, about)]
pub struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that talks to a bus.
#[derive(Args, Clone)]
pub struct LinkArgs {
    /// Serial port to use; autodetected when omitted
    #[arg(long)]
    pub device: Option<String>,

    /// Baud rate to use; autodetected when omitted
    #[arg(long)]
    pub baud_rate: Option<u32>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List serial ports visible to the host
    Ports,

    /// Find ESCs and print their identity
    Scan {
        #[command(flatten)]
        link: LinkArgs,

        /// Emit machine-readable JSON instead of the table
        #[arg(long)]
        json: bool,
    },

    /// Spin motors and stream telemetry (propellers off!)
    Spin {
        #[command(flatten)]
        link: LinkArgs,

        /// Target ESC ID; 255 addresses all
        #[arg(long)]
        id: u8,

        /// Open-loop power in percent (-100..=100)
        #[arg(long, default_value_t = 10)]
        power: i16,

        /// Closed-loop RPM target; overrides --power when given
        #[arg(long)]
        rpm: Option<i32>,

        /// Stop after this many seconds; 0 runs until interrupted
        #[arg(long, default_value_t = 0)]
        timeout: u64,

        /// Skip the interactive safety prompt
        #[arg(long)]
        skip_prompt: bool,

        /// Red LED channel
        #[arg(long, default_value_t = 0)]
        led_red: u8,

        /// Green LED channel
        #[arg(long, default_value_t = 0)]
        led_green: u8,

        /// Blue LED channel
        #[arg(long, default_value_t = 0)]
        led_blue: u8,

        /// Command rate in Hz (floor 10: devices failsafe below that)
        #[arg(long, default_value_t = 100)]
        cmd_rate: u32,
    },

    /// Cycle the status LEDs on every detected ESC
    Led {
        #[command(flatten)]
        link: LinkArgs,
    },

    /// Install a firmware image on one ESC
    UploadFirmware {
        #[command(flatten)]
        link: LinkArgs,

        /// Firmware binary to install
        #[arg(long)]
        firmware_file: PathBuf,

        /// Target ESC ID
        #[arg(long)]
        id: u8,

        /// Baud rate of the bootloader protocol
        #[arg(long, default_value_t = esclink_core::protocol::DEFAULT_BOOTLOADER_BAUD)]
        bootloader_baud_rate: u32,

        /// Assume the device already sits in its bootloader (requires
        /// --device) and skip the firmware-side reset
        #[arg(long)]
        skip_firmware_reset: bool,
    },

    /// Push a parameter file to every ESC on the bus
    UploadParams {
        #[command(flatten)]
        link: LinkArgs,

        /// Parameter file (.xml or .eep)
        #[arg(long)]
        params_file: PathBuf,

        /// Comma-separated block filter: all, board, id, uart, tune
        #[arg(long, default_value = "all")]
        filter: String,
    },

    /// Read back and cross-check parameters from every ESC
    VerifyParams {
        #[command(flatten)]
        link: LinkArgs,

        /// Number of ESCs expected on the bus
        #[arg(long, default_value_t = 4)]
        num_escs: u8,

        /// Save each device's parameters to escN_params.xml
        #[arg(long)]
        save_params: bool,
    },
}
