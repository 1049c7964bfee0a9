//! Human-readable rendering of run summaries and reports.

use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use pagesync_core::sync_engine::{CleanupReport, Plan, RecheckReport, StatusReport};
use pagesync_core::RunSummary;

use crate::style;

pub fn print_summary(summary: &RunSummary) {
    println!();
    let title = if summary.dry_run {
        format!("{} (dry run)", style::direction(summary.direction))
    } else {
        style::direction(summary.direction)
    };
    println!("{} {}", style::header("Run"), title);
    println!("  {}", style::dim(&format!("run id {}", summary.run_id)));
    if summary.resumed {
        println!("  {}", style::dim("resumed from checkpoint"));
    }
    println!();

    if let Some(plan) = &summary.plan {
        print_plan(plan);
        return;
    }

    let rows = [
        ("Pulled", summary.pulled),
        ("Pushed", summary.pushed),
        ("Created", summary.created),
        ("Merged", summary.merged),
        ("Moved", summary.moved),
        ("Attachments", summary.attachments),
        ("Unchanged", summary.unchanged),
    ];
    for (label, count) in rows {
        if count > 0 {
            println!("  {:<12} {}", label, count);
        }
    }
    if !summary.skipped.is_empty() {
        println!("  {:<12} {} (not found)", "Skipped", summary.skipped.len());
    }
    if summary.inaccessible > 0 {
        println!(
            "{}",
            style::warn(&format!(
                "{} item(s) became remote-inaccessible; see `pagesync recheck`",
                summary.inaccessible
            ))
        );
    }
    if summary.conflicts > 0 {
        println!(
            "{}",
            style::warn(&format!(
                "{} conflict(s) left with markers; edit the files or run `pagesync resolve`",
                summary.conflicts
            ))
        );
    }
    for failure in &summary.failed {
        println!(
            "{}",
            style::error(&format!("{} [{}]: {}", failure.id, failure.kind, failure.error))
        );
    }

    println!();
    if summary.cancelled {
        println!("{}", style::warn("Interrupted; the next run resumes from the checkpoint"));
    } else if summary.checkpoint_kept {
        println!("{}", style::warn("Finished with failures; the next run retries them"));
    } else if summary.is_clean() {
        println!("{}", style::success("Done"));
    } else {
        println!("{}", style::success("Done, with items to look at"));
    }
}

fn print_plan(plan: &Plan) {
    if plan.is_empty() && plan.failures.is_empty() {
        println!("{}", style::success("Nothing to do"));
        return;
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Action", "Item"]);
    for id in &plan.pulls {
        table.add_row(vec![Cell::new("pull"), Cell::new(id)]);
    }
    for id in &plan.pushes {
        table.add_row(vec![Cell::new("push"), Cell::new(id)]);
    }
    for id in &plan.conflicts {
        table.add_row(vec![Cell::new("merge"), Cell::new(id)]);
    }
    for step in &plan.moves {
        table.add_row(vec![
            Cell::new("move"),
            Cell::new(format!("{}: {} -> {}", step.id, step.from, step.to)),
        ]);
    }
    for path in &plan.creates {
        table.add_row(vec![Cell::new("create"), Cell::new(path)]);
    }
    for failure in &plan.failures {
        table.add_row(vec![
            Cell::new("blocked").fg(comfy_table::Color::Red),
            Cell::new(format!("{}: {}", failure.id, failure.error)),
        ]);
    }
    println!("{table}");
    println!("  {}", style::dim(&format!("{} unchanged", plan.skips.len())));
}

pub fn print_status(report: &StatusReport, all: bool) {
    println!();
    println!("{}", style::header(&format!("Scope {}", report.scope)));
    println!(
        "  {}",
        style::dim(&format!(
            "last run {}",
            report.last_run_at.as_deref().unwrap_or("never")
        ))
    );
    println!();

    let shown: Vec<_> = report
        .items
        .iter()
        .filter(|i| all || i.state != pagesync_core::models::SyncState::Synced)
        .collect();
    if !shown.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["ID", "Path", "State", "Version"]);
        for item in shown {
            table.add_row(vec![
                Cell::new(&item.id),
                Cell::new(&item.path),
                style::state_cell(item.state),
                Cell::new(item.version),
            ]);
        }
        println!("{table}");
        println!();
    }

    for (state, count) in &report.counts {
        println!("  {:<20} {}", state, count);
    }
    if !report.untracked.is_empty() {
        println!();
        println!("  {}", style::header("New local documents"));
        for path in &report.untracked {
            println!("    {path}");
        }
    }
    if !report.broken_links.is_empty() {
        println!();
        println!(
            "{}",
            style::warn(&format!("{} broken link(s)", report.broken_links.len()))
        );
        for link in &report.broken_links {
            println!("    {} -> {}", link.source_id, link.target.value());
        }
    }
    if !report.orphans.is_empty() {
        println!(
            "  {}",
            style::dim(&format!("{} item(s) with no incoming links", report.orphans.len()))
        );
    }
    if let Some(checkpoint) = &report.checkpoint {
        println!();
        println!(
            "{}",
            style::warn(&format!(
                "Unfinished run: {} processed, {} to retry, started {}",
                checkpoint.processed,
                checkpoint.failed_ids.len(),
                checkpoint.started_at.format("%Y-%m-%d %H:%M")
            ))
        );
    }
    println!();
}

pub fn print_recheck(report: &RecheckReport) {
    for id in &report.restored {
        println!("{}", style::success(&format!("{id} is reachable again")));
    }
    for id in &report.still_inaccessible {
        println!("{}", style::dim(&format!("{id} is still inaccessible")));
    }
    for failure in &report.failed {
        println!("{}", style::error(&format!("{}: {}", failure.id, failure.error)));
    }
    if report.restored.is_empty() && report.still_inaccessible.is_empty() && report.failed.is_empty()
    {
        println!("{}", style::success("No inaccessible items"));
    }
}

pub fn print_cleanup(report: &CleanupReport) {
    for id in &report.removed {
        println!("{}", style::success(&format!("removed {id}")));
    }
    for id in &report.refused {
        println!(
            "{}",
            style::warn(&format!("{id} is not remote-inaccessible, left alone"))
        );
    }
    println!(
        "  {}",
        style::dim(&format!("{} local file(s) deleted", report.files_deleted))
    );
}
