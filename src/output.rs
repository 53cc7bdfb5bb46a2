/*!
 * Terminal output for the tether CLI
 *
 * Tables for locations, repositories, plans and historical jobs, plus the
 * styled status lines the commands print.
 */

use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use console::{style, StyledObject};
use tether_connect::{LocationStatus, Repositories};
use tether_core::snapshot::{ExternalJobRef, StepKind};
use tether_core::{ExternalExecutionPlan, HistoricalJob, RepresentedJob};

/// Brand colors for consistent styling
pub struct Theme;

impl Theme {
    pub fn success<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).green()
    }

    pub fn warning<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).yellow()
    }

    pub fn error<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).red()
    }

    pub fn muted<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).dim()
    }

    /// Header style (bold cyan)
    pub fn header<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).cyan().bold()
    }
}

pub struct Icons;

impl Icons {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
    pub const WARNING: &'static str = "⚠";
    pub const ARROW_RIGHT: &'static str = "→";
}

/// One row of the `locations` table
#[derive(Debug, Clone)]
pub struct LocationRow {
    pub name: String,
    pub kind: &'static str,
    pub status: LocationStatus,
    pub server_id: Option<String>,
    pub repositories: Option<usize>,
    pub error: Option<String>,
}

/// Create a styled data table
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn header_cells(titles: &[&str]) -> Vec<Cell> {
    titles
        .iter()
        .map(|t| Cell::new(t).fg(Color::Cyan).add_attribute(Attribute::Bold))
        .collect()
}

fn status_cell(status: LocationStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        LocationStatus::Connected => cell.fg(Color::Green),
        LocationStatus::Failed => cell.fg(Color::Red),
        LocationStatus::Registered | LocationStatus::Disconnected => cell.fg(Color::Yellow),
    }
}

pub fn locations_table(rows: &[LocationRow]) -> Table {
    let mut table = create_table();
    table.set_header(header_cells(&[
        "Location",
        "Type",
        "Status",
        "Server",
        "Repositories",
        "Error",
    ]));

    for row in rows {
        table.add_row(vec![
            Cell::new(&row.name),
            Cell::new(row.kind),
            status_cell(row.status),
            Cell::new(row.server_id.as_deref().unwrap_or("-")),
            Cell::new(
                row.repositories
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(row.error.as_deref().unwrap_or("")).fg(Color::Red),
        ]);
    }
    table
}

pub fn repositories_table(location: &str, repositories: &Repositories) -> Table {
    let mut table = create_table();
    table.set_header(header_cells(&[
        "Location",
        "Repository",
        "Jobs",
        "Schedules",
        "Sensors",
        "Partition sets",
    ]));

    for (name, repo) in repositories {
        table.add_row(vec![
            Cell::new(location),
            Cell::new(name),
            Cell::new(repo.job_names().join(", ")),
            Cell::new(repo.get_schedules().len()),
            Cell::new(repo.get_sensors().len()),
            Cell::new(repo.get_partition_sets().len()),
        ]);
    }
    table
}

/// Jobs of one repository with the snapshot ids runs record
pub fn jobs_table(repository: &str, jobs: &[ExternalJobRef]) -> Table {
    let mut table = create_table();
    table.set_header(header_cells(&["Repository", "Job", "Snapshot", "Subset of"]));

    for job in jobs {
        table.add_row(vec![
            Cell::new(repository),
            Cell::new(&job.name),
            Cell::new(short_id(&job.snapshot_id)),
            Cell::new(job.parent_snapshot_id.as_deref().map_or("-", short_id)),
        ]);
    }
    table
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn kind_cell(kind: StepKind) -> Cell {
    match kind {
        StepKind::Compute => Cell::new("compute"),
        StepKind::UnresolvedMapped => Cell::new("mapped").fg(Color::Magenta),
        StepKind::UnresolvedCollect => Cell::new("collect").fg(Color::Magenta),
    }
}

/// Steps grouped by level, with what each waits on
pub fn plan_table(plan: &ExternalExecutionPlan) -> Table {
    let mut table = create_table();
    table.set_header(header_cells(&["Level", "Step", "Kind", "Depends on", "Execute"]));

    let selected = plan.step_keys_to_execute();
    for (level, keys) in plan.topological_step_levels().iter().enumerate() {
        for key in keys {
            let Ok(step) = plan.get_step_by_key(key) else {
                continue;
            };
            let upstream: Vec<_> = plan
                .dependencies_of(key)
                .map(|deps| deps.into_iter().collect())
                .unwrap_or_default();
            let execute = if selected.iter().any(|k| k == key) {
                Cell::new(Icons::SUCCESS).fg(Color::Green)
            } else {
                Cell::new("")
            };
            table.add_row(vec![
                Cell::new(level),
                Cell::new(key),
                kind_cell(step.kind),
                Cell::new(upstream.join(", ")),
                execute,
            ]);
        }
    }
    table
}

/// Ops of a historical job in dependency order
pub fn history_table(job: &HistoricalJob) -> Table {
    let mut table = create_table();
    table.set_header(header_cells(&["Op", "Upstream", "Assets"]));

    let structure = job.get_graph_structure();
    for op_name in job.op_names_in_topological_order() {
        let upstream: Vec<_> = structure
            .edges
            .iter()
            .filter(|(_, downstream)| *downstream == op_name)
            .map(|(upstream, _)| upstream.as_str())
            .collect();
        let assets = job
            .get_op(&op_name)
            .map(|op| {
                op.asset_keys
                    .iter()
                    .map(|key| key.to_user_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(&op_name),
            Cell::new(upstream.join(", ")),
            Cell::new(assets),
        ]);
    }
    table
}

/// Print a section title
pub fn section_header(title: &str) {
    let line_len = 50 - title.len().min(40);
    println!(
        "\n{} {}",
        Theme::header(title),
        Theme::muted("─".repeat(line_len))
    );
}

/// Print a styled error message with optional suggestion
pub fn print_error(message: &str, suggestion: Option<&str>) {
    eprintln!(
        "\n{} {}",
        Theme::error(format!("{} Error:", Icons::ERROR)),
        message
    );

    if let Some(hint) = suggestion {
        eprintln!(
            "  {} {}",
            Theme::muted(Icons::ARROW_RIGHT),
            Theme::muted(hint)
        );
    }
    eprintln!();
}

pub fn print_warning(message: &str) {
    eprintln!(
        "{} {}",
        Theme::warning(Icons::WARNING.to_string()),
        Theme::warning(message)
    );
}

pub fn print_success(message: &str) {
    println!(
        "{} {}",
        Theme::success(Icons::SUCCESS.to_string()),
        Theme::success(message)
    );
}
