//! `esclink upload-params` - push a parameter file to every ESC

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use esclink_core::params::{params_from_eep, params_from_xml, ParamKind, ParameterSet};

use super::connect;
use crate::cli::LinkArgs;

pub fn run(link: &LinkArgs, params_file: &Path, filter: &str) -> Result<()> {
    let set = load_params_file(params_file)?;
    if let Err(e) = set.check() {
        bail!("refusing to push invalid parameters: {}", e);
    }

    let kinds = parse_filter(filter)?;

    let (mut conn, _) = connect(link)?;
    std::thread::sleep(Duration::from_millis(250));

    let escs = conn.escs();
    if escs.is_empty() {
        bail!("no ESCs detected");
    }
    println!("ESCs detected:");
    for esc in &escs {
        println!(
            "  ID: {}, SW: {}, HW: {}",
            esc.id, esc.version.firmware, esc.version.hardware
        );
    }

    println!("Uploading params...");
    for kind in kinds {
        println!("-- {} config", kind);
        conn.push_config(kind, &set)?;
        // fire-and-forget push; let the devices commit before the next block
        std::thread::sleep(Duration::from_millis(100));
    }
    println!("    DONE");

    // settle, then reboot everything into the new configuration
    std::thread::sleep(Duration::from_secs(1));
    println!("Resetting ESCs...");
    conn.reset_all()?;
    println!("    DONE");

    conn.close();
    Ok(())
}

fn load_params_file(path: &Path) -> Result<ParameterSet> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    match ext.as_str() {
        "xml" => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("unable to read {}", path.display()))?;
            Ok(params_from_xml(&text)?)
        }
        "eep" => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("unable to read {}", path.display()))?;
            Ok(params_from_eep(&bytes)?)
        }
        other => bail!("unsupported params file type '{}'", other),
    }
}

fn parse_filter(filter: &str) -> Result<Vec<ParamKind>> {
    if filter.trim().eq_ignore_ascii_case("all") {
        return Ok(ParamKind::ALL.to_vec());
    }
    let mut kinds = Vec::new();
    for part in filter.split(',') {
        let kind = match part.trim().to_lowercase().as_str() {
            "board" => ParamKind::Board,
            "id" => ParamKind::Id,
            "uart" => ParamKind::Uart,
            "tune" => ParamKind::Tune,
            other => bail!("unknown params filter '{}'", other),
        };
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_parses_all_and_lists() {
        assert_eq!(parse_filter("all").unwrap(), ParamKind::ALL.to_vec());
        assert_eq!(
            parse_filter("board,tune").unwrap(),
            vec![ParamKind::Board, ParamKind::Tune]
        );
        assert!(parse_filter("bogus").is_err());
    }
}
