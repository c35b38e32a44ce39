use crate::errors::ReplayError;
use crate::report::{RowStatus, SummaryRow, TestReport};
use crate::runtime::Terminal;
use crossterm::style::Stylize;
use ratatui::backend::TestBackend;
use ratatui::layout::Constraint;
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, Cell, Row, Table};

const BANNER_WIDTH: usize = 60;
const TABLE_WIDTH: u16 = 120;

pub fn stage_banner(stage: &str) -> String {
    format!("{:=^width$}", format!(" STAGE {stage} STARTING "), width = BANNER_WIDTH)
}

fn status_color(status: RowStatus) -> Color {
    match status {
        RowStatus::Pass => Color::Green,
        RowStatus::Fail => Color::Red,
        RowStatus::Error => Color::Magenta,
    }
}

fn colored_token(status: RowStatus, color: bool) -> String {
    if !color {
        return status.as_str().to_string();
    }
    match status {
        RowStatus::Pass => status.as_str().green().to_string(),
        RowStatus::Fail => status.as_str().red().bold().to_string(),
        RowStatus::Error => status.as_str().magenta().bold().to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(3)).collect::<String>();
    out.push_str("...");
    out
}

/// Renders the summary table into a plain string frame.
pub fn render_summary_table(report: &TestReport, width: u16) -> Result<String, ReplayError> {
    let rows = report.rows();
    let height = u16::try_from(rows.len()).unwrap_or(u16::MAX).saturating_add(4);
    let backend = TestBackend::new(width, height);
    let mut terminal =
        ratatui::Terminal::new(backend).map_err(|e| ReplayError::Io(e.to_string()))?;
    let detail_width = usize::from(width.saturating_sub(70));
    terminal
        .draw(|frame| {
            let body = rows.iter().map(|row: &SummaryRow| {
                Row::new(vec![
                    Cell::from(row.fixture_key.clone()),
                    Cell::from(row.param_name.clone()),
                    Cell::from(row.assertion.clone()),
                    Cell::from(row.status.as_str())
                        .style(Style::default().fg(status_color(row.status))),
                    Cell::from(truncate(&row.detail, detail_width)),
                ])
            });
            let table = Table::new(
                body,
                [
                    Constraint::Length(18),
                    Constraint::Length(14),
                    Constraint::Length(24),
                    Constraint::Length(7),
                    Constraint::Min(10),
                ],
            )
            .header(
                Row::new(vec!["fixture", "param", "assertion", "status", "detail"])
                    .style(Style::default().add_modifier(Modifier::BOLD)),
            )
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!("{} ({})", report.test_name, report.run_id)),
            );
            frame.render_widget(table, frame.area());
        })
        .map_err(|e| ReplayError::Io(e.to_string()))?;

    let buffer = terminal.backend().buffer().clone();
    let mut out = String::new();
    for y in 0..height {
        let mut line = String::new();
        for x in 0..width {
            line.push_str(buffer[(x, y)].symbol());
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    Ok(out)
}

pub fn summary_lines(report: &TestReport, color: bool) -> Vec<String> {
    report
        .rows()
        .iter()
        .map(|row| {
            let mut line = format!(
                "{} {} [{}] {}",
                colored_token(row.status, color),
                row.test_name,
                row.param_name,
                row.assertion
            );
            if row.fixture_key != row.test_name {
                line.push_str(&format!(" (fixture {})", row.fixture_key));
            }
            if !row.detail.is_empty() {
                line.push_str(&format!(": {}", row.detail));
            }
            line
        })
        .collect()
}

/// Prints the per-assertion summary and, whatever the outcome, where the artifacts live.
pub fn print_summary(terminal: &dyn Terminal, report: &TestReport) -> Result<(), ReplayError> {
    let tty = terminal.stdout_is_tty();
    if tty {
        terminal.draw(&render_summary_table(report, TABLE_WIDTH)?)?;
    } else {
        for line in summary_lines(report, false) {
            terminal.write_line(&line)?;
        }
    }
    let verdict = if report.passed() {
        colored_token(RowStatus::Pass, tty)
    } else {
        colored_token(RowStatus::Fail, tty)
    };
    terminal.write_line(&format!("{verdict} {}", report.test_name))?;
    terminal.write_line(&format!("Artifacts: {}", report.run_dir.display()))?;
    terminal.write_line(&format!(
        "Re-run analysis: replay_test --analyze {}",
        report.run_id
    ))?;
    Ok(())
}
