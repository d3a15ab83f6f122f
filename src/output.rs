use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;

use crate::error::Result;
use crate::identity::Identity;
use crate::model::{AcquireOutcome, ConflictStatus, Instance, LockHolder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
    Minimal,
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn print_identity(identity: &Identity, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(identity)?),
        Format::Pretty => {
            println!("{}", identity.id.cyan().bold());
            println!("  {} {}", "session:".dimmed(), identity.session_key);
            println!(
                "  {} {}",
                "branch:".dimmed(),
                identity.branch.as_deref().unwrap_or("-")
            );
            println!(
                "  {} {}",
                "task:".dimmed(),
                identity.task.as_deref().unwrap_or("-")
            );
            if identity.ephemeral {
                println!("  {}", "ephemeral (session file not writable)".yellow());
            }
        }
        Format::Minimal => println!("{}", identity.id),
    }
    Ok(())
}

fn print_holder_pretty(holder: &LockHolder) {
    println!(
        "{} {}",
        holder.lock.file_path.green(),
        format!("[{}]", holder.instance_id()).cyan().bold(),
    );
    println!(
        "  {} {} | {} {}",
        "branch:".dimmed(),
        holder.branch(),
        "task:".dimmed(),
        holder.task()
    );
    println!("  {} {}", "intent:".dimmed(), holder.lock.intent);
    println!(
        "  {} {}",
        "expires:".dimmed(),
        timestamp(holder.lock.expires_at)
    );
}

pub fn print_locks(locks: &[LockHolder], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(locks)?),
        Format::Pretty => {
            if locks.is_empty() {
                println!("{}", "No active locks.".dimmed());
            }
            for holder in locks {
                print_holder_pretty(holder);
            }
        }
        Format::Minimal => {
            for holder in locks {
                println!("{} {}", holder.lock.file_path, holder.instance_id());
            }
        }
    }
    Ok(())
}

pub fn print_instances(instances: &[Instance], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(instances)?),
        Format::Pretty => {
            if instances.is_empty() {
                println!("{}", "No registered instances.".dimmed());
            }
            for inst in instances {
                let pid = inst.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                println!(
                    "{} {}",
                    format!("[{}]", inst.id).cyan().bold(),
                    format!("pid={pid}").dimmed(),
                );
                println!(
                    "  {} {} | {} {}",
                    "branch:".dimmed(),
                    inst.branch.as_deref().unwrap_or("-"),
                    "task:".dimmed(),
                    inst.task.as_deref().unwrap_or("-")
                );
                println!(
                    "  {} {}",
                    "heartbeat:".dimmed(),
                    timestamp(inst.last_heartbeat)
                );
            }
        }
        Format::Minimal => {
            for inst in instances {
                println!("{}", inst.id);
            }
        }
    }
    Ok(())
}

/// Result of `check`: the holder, if locked.
pub fn print_check(
    file_path: &str,
    holder: Option<&LockHolder>,
    self_id: &str,
    format: Format,
) -> Result<()> {
    match format {
        Format::Json => println!(
            "{}",
            serde_json::json!({
                "file_path": file_path,
                "locked": holder.is_some(),
                "held_by_self": holder.is_some_and(|h| h.instance_id() == self_id),
                "holder": holder,
            })
        ),
        Format::Pretty => match holder {
            None => println!("{} {}", file_path.green(), "unlocked".dimmed()),
            Some(h) if h.instance_id() == self_id => {
                println!("{} {}", file_path.green(), "held by this instance".cyan())
            }
            Some(h) => {
                println!("{}", "Locked by another instance:".red().bold());
                print_holder_pretty(h);
            }
        },
        Format::Minimal => match holder {
            None => println!("unlocked"),
            Some(h) => println!("{}", h.instance_id()),
        },
    }
    Ok(())
}

pub fn print_acquire(file_path: &str, outcome: &AcquireOutcome, format: Format) -> Result<()> {
    match format {
        Format::Json => {
            let mut value = serde_json::to_value(outcome)?;
            value["file_path"] = file_path.into();
            println!("{value}");
        }
        Format::Pretty => match outcome {
            AcquireOutcome::Acquired => println!("Acquired {}", file_path.green()),
            AcquireOutcome::Renewed => println!("Renewed {}", file_path.green()),
            AcquireOutcome::Reclaimed { previous_holder } => println!(
                "Reclaimed {} {}",
                file_path.green(),
                format!("(expired lease of {previous_holder})").yellow()
            ),
            AcquireOutcome::LockedByOther { holder } => {
                println!("{}", "Locked by another instance:".red().bold());
                print_holder_pretty(holder);
            }
        },
        Format::Minimal => {
            let word = match outcome {
                AcquireOutcome::Acquired => "acquired",
                AcquireOutcome::Renewed => "renewed",
                AcquireOutcome::Reclaimed { .. } => "reclaimed",
                AcquireOutcome::LockedByOther { .. } => "locked",
            };
            println!("{word}");
        }
    }
    Ok(())
}

pub fn print_conflict(file_path: &str, status: &ConflictStatus, format: Format) -> Result<()> {
    match format {
        Format::Json => {
            let mut value = serde_json::to_value(status)?;
            value["file_path"] = file_path.into();
            println!("{value}");
        }
        Format::Pretty => match status {
            ConflictStatus::Clean => println!("{} {}", file_path.green(), "unchanged".dimmed()),
            ConflictStatus::Unlocked => println!("{} {}", file_path, "not locked".dimmed()),
            ConflictStatus::Changed { expected, actual } => {
                println!("{} {}", file_path.yellow(), "changed since locked".red());
                println!(
                    "  {} {}",
                    "expected:".dimmed(),
                    expected.as_deref().unwrap_or("(missing)")
                );
                println!(
                    "  {} {}",
                    "actual:".dimmed(),
                    actual.as_deref().unwrap_or("(missing)")
                );
            }
        },
        Format::Minimal => {
            let word = match status {
                ConflictStatus::Clean => "clean",
                ConflictStatus::Unlocked => "unlocked",
                ConflictStatus::Changed { .. } => "changed",
            };
            println!("{word}");
        }
    }
    Ok(())
}
