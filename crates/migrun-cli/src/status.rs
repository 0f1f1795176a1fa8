use std::fmt::Write;
use std::path::Path;

use migrun_db::{MigrationState, MigrationStatus};

const WIDTH: usize = 78;
const ID_W: usize = 18;
const STATE_W: usize = 9;
const APPLIED_W: usize = 17;

/// Render the status box: counts on top, one row per known migration.
pub fn render(status: &MigrationStatus, database: &Path) -> String {
    let version = env!("CARGO_PKG_VERSION");
    let inner = WIDTH - 4;
    let name_w = inner - ID_W - STATE_W - APPLIED_W - 3;

    let db_display = match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => database.to_string_lossy().replace(&home, "~"),
        _ => database.to_string_lossy().to_string(),
    };

    let title = format!("migrun v{version}");
    let title_dashes = WIDTH - 2 - title.len() - 5;
    let top = format!("╭─── {title} {}╮", "─".repeat(title_dashes));
    let rule = format!("├{}┤", "─".repeat(WIDTH - 2));
    let bottom = format!("╰{}╯", "─".repeat(WIDTH - 2));
    let row = |text: &str| format!("│ {:<inner$} │", truncate(text, inner));

    let mut out = String::new();
    let _ = writeln!(out, "{top}");
    let _ = writeln!(out, "{}", row(&format!("Database    {db_display}")));
    let _ = writeln!(
        out,
        "{}",
        row(&format!(
            "Applied     {}    Pending {}",
            status.applied_count(),
            status.pending_count()
        ))
    );
    if let Some(lock) = &status.lock {
        let _ = writeln!(
            out,
            "{}",
            row(&format!(
                "Locked by   {} since {}",
                lock.holder,
                lock.acquired_at.format("%Y-%m-%d %H:%M:%S")
            ))
        );
    }
    let _ = writeln!(out, "{rule}");

    if status.migrations.is_empty() {
        let _ = writeln!(out, "{}", row("no migrations found"));
    } else {
        let header = format!(
            "{:<ID_W$} {:<name_w$} {:<STATE_W$} {:<APPLIED_W$}",
            "ID", "NAME", "STATE", "APPLIED AT"
        );
        let _ = writeln!(out, "{}", row(&header));
        for entry in &status.migrations {
            let state = match (entry.state, entry.drifted) {
                (MigrationState::Applied, true) => "drifted".to_string(),
                (state, _) => state.to_string(),
            };
            let applied = entry
                .applied_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            let line = format!(
                "{:<ID_W$} {:<name_w$} {:<STATE_W$} {:<APPLIED_W$}",
                entry.id,
                truncate(&entry.name, name_w),
                state,
                applied
            );
            let _ = writeln!(out, "{}", row(&line));
        }
    }

    if !status.unknown_applied.is_empty() {
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(
            out,
            "{}",
            row(&format!(
                "Applied but unknown: {}",
                status.unknown_applied.join(", ")
            ))
        );
    }
    let _ = writeln!(out, "{bottom}");
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut cut: String = s.chars().take(max.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
