use super::{colorize_integrity, json_pretty, EXIT_HOST_ERROR, EXIT_SUCCESS};
use stratum_core::{BaseIntegrity, BaseReport, Engine};

fn status_name(integrity: &BaseIntegrity) -> &'static str {
    match integrity {
        BaseIntegrity::Intact => "intact",
        BaseIntegrity::Writable => "writable",
        BaseIntegrity::Modified { .. } => "modified",
        BaseIntegrity::Unsealed => "unsealed",
    }
}

pub fn run(engine: &Engine, base: Option<&str>, all: bool, json: bool) -> Result<u8, String> {
    let reports = if all {
        engine.verify_all().map_err(|e| e.to_string())?
    } else {
        let base = match base {
            Some(name) => engine.image_named(name),
            None => engine.latest_base(),
        }
        .map_err(|e| e.to_string())?;
        let integrity = engine.verify(&base.name).map_err(|e| e.to_string())?;
        vec![BaseReport { base, integrity }]
    };

    if json {
        println!("{}", json_pretty(&reports)?);
    } else if reports.is_empty() {
        println!("no sealed bases found");
    } else {
        for report in &reports {
            println!(
                "{:<24} {}",
                report.base.lvm_name(),
                colorize_integrity(status_name(&report.integrity))
            );
            if let BaseIntegrity::Modified { expected, actual } = &report.integrity {
                println!("  expected {expected}");
                println!("  actual   {actual}");
            }
        }
    }

    if reports.iter().all(|r| r.integrity.is_intact()) {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_HOST_ERROR)
    }
}
