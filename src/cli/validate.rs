use std::path::Path;

use anyhow::Result;

use crate::cli::config::Config;
use crate::engine::RunPlan;

/// Parse and sanity-check a scenario config without running it.
pub fn run_validate(path: &Path) -> Result<()> {
    println!("Validating {}...", path.display());

    let config = match Config::load(path) {
        Ok(config) => {
            println!("  ✓ Config parsed");
            config
        }
        Err(e) => {
            println!("  ✗ {}", e);
            return Err(e);
        }
    };

    match RunPlan::from_config(&config) {
        Ok(plan) => {
            println!("  ✓ Plan resolved");
            println!("    target: {}{}", plan.base_url, plan.rpc_path);
            for (name, schedule) in &plan.scenarios {
                println!("    scenario '{}': {:?}", name, schedule);
            }
            println!("    workload: {} request(s)", plan.workload.len());
            println!("    checks: {}", plan.checks.len());
            let threshold_count: usize = plan.criteria.values().map(|v| v.len()).sum();
            if threshold_count == 0 {
                println!("  ⚠ No thresholds configured (run always exits 0)");
            } else {
                println!("    thresholds: {}", threshold_count);
            }
            Ok(())
        }
        Err(e) => {
            println!("  ✗ Validation failed: {}", e);
            Err(e)
        }
    }
}
