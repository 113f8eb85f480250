//! Terminal rendering utilities.
//!
//! Plain column tables for the administrative commands.

use chrono::{DateTime, Utc};
use console::style;
use saferun_sandbox::container::ImageRef;
use saferun_sandbox::ManagedContainer;

/// Shorten a container id the way `docker ps` does.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn created(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Print managed containers as a table.
pub fn print_containers(containers: &[ManagedContainer]) {
    if containers.is_empty() {
        println!("No managed containers.");
        return;
    }

    println!(
        "{:<14} {:<22} {:<28} {:<10} {:<8} {}",
        "ID", "NAME", "IMAGE", "STATE", "RUNS", "CREATED"
    );
    println!("{}", "-".repeat(108));
    for c in containers {
        let state = if c.summary.is_running() {
            style(c.summary.state.as_str()).green()
        } else {
            style(c.summary.state.as_str()).dim()
        };
        let runs = c.runs.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<14} {:<22} {:<28} {:<10} {:<8} {}",
            short_id(&c.summary.id),
            c.summary.name,
            c.summary.image,
            state,
            runs,
            created(c.summary.created_at)
        );
    }
    println!("\n{} container(s) total.", containers.len());
}

/// Print managed images as a table.
pub fn print_images(images: &[ImageRef]) {
    if images.is_empty() {
        println!("No managed images.");
        return;
    }

    println!(
        "{:<24} {:<20} {:<14} {:<18} {}",
        "REPOSITORY", "TAG", "ID", "CREATED", "SIZE"
    );
    println!("{}", "-".repeat(88));
    for image in images {
        println!(
            "{:<24} {:<20} {:<14} {:<18} {}",
            image.repository,
            image.tag,
            short_id(image.id.trim_start_matches("sha256:")),
            image.created_since,
            image.size
        );
    }
    println!("\n{} image(s) total.", images.len());
}

/// Print every known field of one container.
pub fn print_container_detail(c: &ManagedContainer) {
    println!("{}", style(&c.summary.name).bold());
    println!("  {:<12} {}", "id", c.summary.id);
    println!("  {:<12} {}", "image", c.summary.image);
    println!("  {:<12} {}", "state", c.summary.state);
    println!("  {:<12} {}", "status", c.summary.status);
    println!("  {:<12} {}", "created", created(c.summary.created_at));
    if let Some(state) = c.pool_state {
        println!("  {:<12} {}", "pool", state);
    }
    if let Some(runs) = c.runs {
        println!("  {:<12} {}", "runs", runs);
    }
    if !c.summary.labels.is_empty() {
        println!("  labels");
        for (key, value) in &c.summary.labels {
            println!("    {}={}", key, value);
        }
    }
}
