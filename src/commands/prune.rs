use colored::Colorize;

use crate::error::Result;
use crate::output::Format;
use crate::store::repo::Repo;

pub fn run(repo: &Repo, format: Format) -> Result<()> {
    let report = repo.manager.prune()?;
    match format {
        Format::Json => println!("{}", serde_json::to_string(&report)?),
        Format::Pretty => {
            if report.expired_locks.is_empty() && report.stale_instances.is_empty() {
                println!("{}", "Nothing to prune.".dimmed());
            }
            for path in &report.expired_locks {
                println!("{} {}", "expired lock:".dimmed(), path.yellow());
            }
            for id in &report.stale_instances {
                println!("{} {}", "stale instance:".dimmed(), id.yellow());
            }
        }
        Format::Minimal => println!(
            "{} {}",
            report.expired_locks.len(),
            report.stale_instances.len()
        ),
    }
    Ok(())
}
