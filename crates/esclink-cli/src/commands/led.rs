//! `esclink led` - cycle the status LEDs on every detected ESC

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use super::connect;
use crate::cli::LinkArgs;

pub fn run(link: &LinkArgs) -> Result<()> {
    let (mut conn, _) = connect(link)?;
    std::thread::sleep(Duration::from_millis(250));

    let ids: Vec<u8> = conn.escs().iter().map(|e| e.id).collect();
    if ids.is_empty() {
        bail!("no ESCs detected");
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))?;

    println!("Running LED test on {} ESC(s), ctrl-c to stop...", ids.len());
    let started = Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(10));

        // cycle through red, green, blue, one second each; the LED state
        // rides along with the zero-power command frames
        let dt = started.elapsed().as_secs_f64() % 3.0;
        let leds = [dt < 1.0, (1.0..2.0).contains(&dt), dt >= 2.0];

        for &id in &ids {
            conn.set_target_power(id, 0)?;
            conn.set_leds(id, leds)?;
        }
    }

    conn.close();
    Ok(())
}
