use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};

use prism_core::{CheckReport, RunReport};

/// Print a run report: what was imported, then what was generated.
pub fn print_run_summary(report: &RunReport) {
    if report.merged.is_empty() {
        println!("{}", "First run: no package edits to import.".dimmed());
    }

    for merge in &report.merged {
        if merge.applied {
            let changes = merge
                .changes
                .as_ref()
                .map(|summary| summary.total())
                .unwrap_or(0);
            println!(
                "{}",
                format!("Imported {} change(s) from {}", changes, merge.name).green()
            );
        } else {
            println!("{}", format!("No changes in {}", merge.name).dimmed());
        }
        if merge.conflicts > 0 {
            println!(
                "{} {} conflict(s) in {} resolved and recorded",
                "WARNING:".yellow().bold(),
                merge.conflicts,
                merge.name
            );
        }
    }

    println!(
        "{}",
        format!("Regenerated {} work package(s):", report.generated.len())
            .green()
            .bold()
    );

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Package"),
            Cell::new("Table"),
            Cell::new("Rows"),
            Cell::new("Dropped"),
        ]);

    for split in &report.generated {
        for rows in &split.tables {
            table.add_row(vec![
                Cell::new(&split.name),
                Cell::new(&rows.table),
                Cell::new(rows.kept),
                Cell::new(rows.dropped),
            ]);
        }
    }

    println!("{table}");
}

/// Print a check report.
pub fn print_check_report(report: &CheckReport) {
    if !report.known_packages.is_empty() {
        println!("Known packages: {}", report.known_packages.join(", "));
    }
    if !report.new_packages.is_empty() {
        println!(
            "{}",
            format!("New packages: {}", report.new_packages.join(", ")).cyan()
        );
    }
    if !report.removed_packages.is_empty() {
        println!(
            "{}",
            format!(
                "Removed packages (edits still imported, no longer generated): {}",
                report.removed_packages.join(", ")
            )
            .yellow()
        );
    }

    if report.issues.is_empty() {
        println!("{}", "Workspace and configuration look good.".green().bold());
        return;
    }

    for issue in &report.issues {
        println!("{} {}", "ERROR:".red().bold(), issue);
    }
}
