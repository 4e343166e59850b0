//! `esclink spin` - spin motors and stream telemetry

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use esclink_core::esc::MAX_SAFE_RPM;
use esclink_core::protocol::{BROADCAST_ID, MIN_COMMAND_RATE_HZ};

use super::connect;
use crate::cli::LinkArgs;

pub struct SpinArgs {
    pub link: LinkArgs,
    pub id: u8,
    pub power: i16,
    pub rpm: Option<i32>,
    pub timeout: u64,
    pub skip_prompt: bool,
    pub leds: [bool; 3],
    pub cmd_rate: u32,
}

pub fn run(args: SpinArgs) -> Result<()> {
    if !(-100..=100).contains(&args.power) {
        bail!("spin power must be between -100 and 100");
    }
    if let Some(rpm) = args.rpm {
        if !(-MAX_SAFE_RPM..=MAX_SAFE_RPM).contains(&rpm) {
            bail!("spin rpm must be between {} and {}", -MAX_SAFE_RPM, MAX_SAFE_RPM);
        }
    }
    if args.cmd_rate < MIN_COMMAND_RATE_HZ {
        bail!("command rate is too low, the ESC will timeout");
    }

    let (mut conn, _) = connect(&args.link)?;
    std::thread::sleep(Duration::from_millis(250));

    let ids: Vec<u8> = if args.id == BROADCAST_ID {
        conn.escs().iter().map(|e| e.id).collect()
    } else {
        if conn.esc(args.id).is_none() {
            bail!("specified ESC ID {} not found", args.id);
        }
        vec![args.id]
    };
    if ids.is_empty() {
        bail!("no ESCs detected");
    }

    if !args.skip_prompt && !confirm_spin()? {
        println!("Test canceled by user");
        return Ok(());
    }

    // poll a single target faster while it spins
    if args.id != BROADCAST_ID {
        conn.set_highspeed_feedback(Some(args.id))?;
    }
    conn.set_command_rate(args.cmd_rate);

    for &id in &ids {
        conn.set_leds(id, args.leds)?;
        match args.rpm {
            Some(rpm) => conn.set_target_rpm(id, rpm)?,
            None => conn.set_target_power(id, args.power)?,
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))?;

    let started = Instant::now();
    while running.load(Ordering::SeqCst)
        && (args.timeout == 0 || started.elapsed() < Duration::from_secs(args.timeout))
    {
        std::thread::sleep(Duration::from_millis(100));
        for &id in &ids {
            if let Some(esc) = conn.esc(id) {
                println!(
                    "[{}] RPM: {}, PWR: {}, VBAT: {:.2}V, TEMPERATURE: {:.2}C, CURRENT: {:.2}A",
                    id,
                    esc.rpm(),
                    esc.power(),
                    esc.voltage(),
                    esc.temperature(),
                    esc.current()
                );
            }
        }
    }

    // spin down before releasing the port
    for &id in &ids {
        conn.set_target_power(id, 0)?;
    }
    std::thread::sleep(Duration::from_millis(100));
    conn.close();
    println!("Finished!");
    Ok(())
}

fn confirm_spin() -> Result<bool> {
    println!("WARNING:");
    println!("This test requires motors to spin at high speeds with");
    println!("propellers attached. Please ensure that appropriate");
    println!("protective equipment is being worn at all times and");
    println!("that the motor and propeller are adequately isolated");
    println!("from all persons.");
    println!();
    print!("Type \"yes\" to continue: ");
    std::io::stdout().flush()?;

    let mut response = String::new();
    std::io::stdin().read_line(&mut response)?;
    Ok(response.trim().eq_ignore_ascii_case("yes"))
}
