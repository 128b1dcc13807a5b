use std::fmt::Write;

use tracing::warn;

use crate::config::OutputFormat;
use crate::error::RenderError;
use crate::models::{DashboardStats, DataSource, DistributionResult};

const PROGRESS_WIDTH: usize = 20;

/// Optional chart capability. `Ok(None)` means "no chart available".
pub trait ChartRenderer {
    fn render_chart(&self, data: &DistributionResult) -> Result<Option<String>, RenderError>;
}

/// Renders nothing; the report falls back to badges.
pub struct NoChart;

impl ChartRenderer for NoChart {
    fn render_chart(&self, _data: &DistributionResult) -> Result<Option<String>, RenderError> {
        Ok(None)
    }
}

/// Vertical text bars, tallest class reaching `height` rows.
pub struct TextBarChart {
    pub height: usize,
}

impl ChartRenderer for TextBarChart {
    fn render_chart(&self, data: &DistributionResult) -> Result<Option<String>, RenderError> {
        if self.height == 0 {
            return Err(RenderError::Chart("chart height must be positive".to_string()));
        }

        let max = data.classes.iter().map(|c| c.total).max().unwrap_or(0);
        if max == 0 {
            return Ok(None);
        }

        let heights: Vec<usize> = data
            .classes
            .iter()
            .map(|c| (c.total * self.height).div_ceil(max))
            .collect();
        let column = 9;

        let mut chart = String::new();
        for row in (1..=self.height).rev() {
            let axis = if row == self.height {
                max.to_string()
            } else {
                String::new()
            };
            let _ = write!(chart, "{axis:>4} |");
            for h in &heights {
                chart.push_str(if *h >= row { "  ████   " } else { "         " });
            }
            chart.push('\n');
        }
        let _ = writeln!(chart, "{:>4} +{}", 0, "-".repeat(column * heights.len()));
        let _ = write!(chart, "      ");
        for item in &data.classes {
            let _ = write!(chart, "{:^width$}", item.class, width = column);
        }
        chart.push('\n');

        Ok(Some(chart))
    }
}

pub fn progress_bar(part: usize, total: usize, width: usize) -> String {
    let filled = if total == 0 {
        0
    } else {
        ((part as f64 / total as f64) * width as f64).round() as usize
    };
    let filled = filled.min(width);
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

pub fn render_badges(data: &DistributionResult) -> String {
    data.classes
        .iter()
        .map(|item| format!("`{}: {}`", item.class, item.total))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn render(
    data: &DistributionResult,
    format: OutputFormat,
    chart: &dyn ChartRenderer,
) -> Result<String, RenderError> {
    match format {
        OutputFormat::Markdown => Ok(build_report(data, chart)),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(data)? + "\n"),
    }
}

pub fn build_report(data: &DistributionResult, chart: &dyn ChartRenderer) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Distribusi Peserta Didik");
    let _ = writeln!(output, "**Total: {} peserta didik**", data.total);
    if data.source == DataSource::Demo {
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "> Demo data: the store is empty, these students are generated placeholders."
        );
    }
    let _ = writeln!(output);

    if data.total == 0 {
        let _ = writeln!(output, "## Belum ada data siswa");
        let _ = writeln!(
            output,
            "Add students with `sekolah-admin student add` to see the distribution."
        );
    } else {
        write_chart(&mut output, data, chart);
        write_gender(&mut output, data);
        write_summary(&mut output, data);
        write_table(&mut output, data);
    }

    if data.excluded > 0 {
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "_{} record(s) with an unknown class were left out._",
            data.excluded
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "Generated {}",
        data.generated_at.format("%Y-%m-%d %H:%M UTC")
    );

    output
}

fn write_chart(output: &mut String, data: &DistributionResult, chart: &dyn ChartRenderer) {
    let _ = writeln!(output, "## Distribusi per Kelas");

    match chart.render_chart(data) {
        Ok(Some(rendered)) => {
            let _ = writeln!(output, "```text");
            output.push_str(&rendered);
            let _ = writeln!(output, "```");
        }
        Ok(None) => {
            let _ = writeln!(output, "Chart tidak dapat ditampilkan.");
        }
        Err(err) => {
            warn!("falling back to badges: {}", err);
            let _ = writeln!(output, "Chart tidak dapat ditampilkan.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "{}", render_badges(data));
    let _ = writeln!(output);
}

fn write_gender(output: &mut String, data: &DistributionResult) {
    let _ = writeln!(output, "## Jenis Kelamin");
    let _ = writeln!(
        output,
        "- Laki-laki  {} {}",
        progress_bar(data.gender.male, data.total, PROGRESS_WIDTH),
        data.gender.male
    );
    let _ = writeln!(
        output,
        "- Perempuan  {} {}",
        progress_bar(data.gender.female, data.total, PROGRESS_WIDTH),
        data.gender.female
    );
    let _ = writeln!(output);
}

fn write_summary(output: &mut String, data: &DistributionResult) {
    let summary = &data.summary;
    let _ = writeln!(output, "## Ringkasan");
    let _ = writeln!(output, "- Classes with students: {}", summary.class_count);
    let _ = writeln!(output, "- Mean per class: {:.1}", summary.mean_per_class);
    let _ = writeln!(output, "- Largest class: {}", summary.largest_class);
    let _ = writeln!(output, "- Smallest class: {}", summary.smallest_class);
    let _ = writeln!(output);
}

fn write_table(output: &mut String, data: &DistributionResult) {
    let _ = writeln!(output, "## Detail");
    let _ = writeln!(output, "| Kelas | Jumlah | Laki-laki | Perempuan | Persentase |");
    let _ = writeln!(output, "|---|---:|---:|---:|---|");
    for item in &data.classes {
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} {:.1}% |",
            item.class,
            item.total,
            item.male,
            item.female,
            progress_bar(item.total, data.total, 10),
            item.percentage
        );
    }
}

pub fn build_dashboard(stats: &DashboardStats) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "Students:  {}", stats.total_students);
    let _ = writeln!(output, "Teachers:  {}", stats.total_teachers);
    let _ = writeln!(output, "Classes:   {}", stats.total_classes);
    let _ = writeln!(output, "Kelas 1-3: {}", stats.lower_grades);
    let _ = writeln!(output, "Kelas 4-6: {}", stats.upper_grades);

    let badges: Vec<String> = stats
        .per_class
        .iter()
        .map(|(class, count)| format!("K{}: {}", class.number(), count))
        .collect();
    let _ = writeln!(output, "{}", badges.join("  "));

    let _ = writeln!(output);
    let _ = writeln!(output, "Recent activity:");
    if stats.recent_activities.is_empty() {
        let _ = writeln!(output, "- No activity recorded yet.");
    } else {
        for activity in &stats.recent_activities {
            let _ = writeln!(
                output,
                "- [{}] {}",
                activity.time.format("%Y-%m-%d %H:%M"),
                activity.message
            );
        }
    }

    output
}
