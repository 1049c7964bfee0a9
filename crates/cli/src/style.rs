//! Shared styling utilities for terminal output.

use comfy_table::{Cell, Color};
use console::Style;

use pagesync_core::models::SyncState;
use pagesync_core::Direction;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Direction label: pulls blue, pushes green, sync cyan.
pub fn direction(direction: Direction) -> String {
    let style = match direction {
        Direction::Pull => Style::new().blue().bold(),
        Direction::Push => Style::new().green().bold(),
        Direction::Sync => Style::new().cyan().bold(),
    };
    style.apply_to(direction.as_str()).to_string()
}

/// Status table cell for a sync state.
pub fn state_cell(state: SyncState) -> Cell {
    let cell = Cell::new(state.as_str());
    match state {
        SyncState::Synced => cell.fg(Color::Green),
        SyncState::LocalModified | SyncState::RemoteModified => cell.fg(Color::Yellow),
        SyncState::Conflict => cell.fg(Color::Red),
        SyncState::RemoteInaccessible => cell.fg(Color::DarkGrey),
        SyncState::Untracked => cell,
    }
}
