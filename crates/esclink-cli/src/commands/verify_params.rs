//! `esclink verify-params` - read back and cross-check parameters

use std::time::Duration;

use anyhow::Result;

use esclink_core::params::{params_to_xml, ParameterSet};

use super::connect;
use crate::cli::LinkArgs;

pub fn run(link: &LinkArgs, num_escs: u8, save_params: bool) -> Result<()> {
    let (mut conn, _) = connect(link)?;
    std::thread::sleep(Duration::from_millis(250));

    let found: Vec<u8> = conn.escs().iter().map(|e| e.id).collect();

    let mut num_invalid = 0usize;
    let mut sets: Vec<(u8, ParameterSet)> = Vec::new();

    for id in 0..num_escs {
        if !found.contains(&id) {
            eprintln!("ERROR: ESC ID {} not found", id);
            continue;
        }

        match conn.read_params(id, Duration::from_secs(1)) {
            Ok(set) => {
                if set.is_valid() {
                    if save_params {
                        let path = format!("esc{}_params.xml", id);
                        std::fs::write(&path, params_to_xml(&set)?)?;
                        println!("Saved params from ESC ID {} to {}", id, path);
                    }
                    sets.push((id, set));
                } else {
                    // one device's bad blocks never taint the others
                    eprintln!("ERROR: params for ID {} are invalid!", id);
                    num_invalid += 1;
                }
            }
            Err(e) => {
                eprintln!("ERROR: params for ID {} could not be read: {}", id, e);
                num_invalid += 1;
            }
        }
    }

    // cross-compare every valid set against the first
    let mut num_match = 0usize;
    if let Some((first_id, reference)) = sets.first() {
        for (id, set) in &sets {
            if set.matches(reference) {
                num_match += 1;
            } else {
                eprintln!("ERROR: params from ID {} and {} are not the same", first_id, id);
            }
        }
    }

    if found.len() == num_escs as usize && num_match == num_escs as usize && num_invalid == 0 {
        println!("Success! Params in all ESCs are valid and identical.");
    } else {
        eprintln!("ERROR: some params are invalid or not the same!");
        eprintln!("       Number of ESCs expected  : {}", num_escs);
        eprintln!("       Number of ESCs found     : {}", found.len());
        eprintln!("       Number of invalid params : {}", num_invalid);
        eprintln!("       Number of matched params : {}", num_match);
    }

    conn.close();
    Ok(())
}
