//! Tabular view model of a traffic analysis
//!
//! The table has one column per charted experiment. Its rows are, in
//! order: priorities, target percentages (once calculated), the
//! experiments' own sampling percentages, then one row of assignment
//! ratios per date. Every row starts with its label cell.

use crate::experiment::Experiment;
use crate::traffic::TrafficResult;
use serde::Serialize;

pub const HEADER_LABEL: &str = "Experiments:";
pub const PRIORITY_ROW: &str = "Priority";
pub const TARGET_ROW: &str = "Target %";
pub const EXPERIMENT_ROW: &str = "Experiment %";

/// Formats a fraction as a percentage with two decimals, e.g. `0.055` as `5.50%`.
pub fn format_percent(fraction: f64) -> String {
    format!("{:.2}%", fraction * 100.0)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrafficTable {
    /// Header cells: the header label followed by experiment labels
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TrafficTable {
    /// Builds the table skeleton from a traffic result, without targets.
    pub fn skeleton(traffic: &TrafficResult) -> Self {
        let mut columns = Vec::with_capacity(traffic.experiments.len() + 1);
        columns.push(HEADER_LABEL.to_string());
        columns.extend(traffic.experiments.iter().cloned());

        let mut priority_row = vec![PRIORITY_ROW.to_string()];
        let mut experiment_row = vec![EXPERIMENT_ROW.to_string()];
        for (index, priority) in traffic.priorities.iter().enumerate() {
            priority_row.push(priority.to_string());
            experiment_row.push(
                traffic
                    .sampling_percentages
                    .get(index)
                    .map(|&fraction| format_percent(fraction))
                    .unwrap_or_default(),
            );
        }

        let mut rows = Vec::with_capacity(traffic.assignment_ratios.len() + 2);
        rows.push(priority_row);
        rows.push(experiment_row);
        for ratio in &traffic.assignment_ratios {
            let mut row = Vec::with_capacity(ratio.values.len() + 1);
            row.push(ratio.date.clone());
            row.extend(ratio.values.iter().map(|&value| format_percent(value)));
            rows.push(row);
        }

        TrafficTable { columns, rows }
    }

    /// Returns a copy of this table with the target row in second position.
    ///
    /// Target cells line up with the experiment columns by label; when the
    /// table has no experiment columns they follow the order of `related`.
    /// An existing target row is replaced.
    pub fn with_targets(&self, related: &[Experiment]) -> Self {
        let target_cell = |experiment: &Experiment| {
            experiment
                .target_sampling_percent
                .map(format_percent)
                .unwrap_or_default()
        };

        let mut target_row = vec![TARGET_ROW.to_string()];
        let labels = self.experiment_labels();
        if labels.is_empty() {
            target_row.extend(related.iter().map(target_cell));
        } else {
            target_row.extend(labels.iter().map(|label| {
                related
                    .iter()
                    .find(|experiment| &experiment.label == label)
                    .map(target_cell)
                    .unwrap_or_default()
            }));
        }

        let mut rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .filter(|row| row.first().map(String::as_str) != Some(TARGET_ROW))
            .cloned()
            .collect();
        let position = rows.len().min(1);
        rows.insert(position, target_row);

        TrafficTable {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Experiment labels of the header, without the header label.
    pub fn experiment_labels(&self) -> &[String] {
        self.columns.get(1..).unwrap_or(&[])
    }

    /// Returns true once the target row has been inserted.
    pub fn has_targets(&self) -> bool {
        self.row(TARGET_ROW).is_some()
    }

    /// Finds a row by its label cell and returns its value cells.
    pub fn row(&self, label: &str) -> Option<&[String]> {
        self.rows
            .iter()
            .find(|row| row.first().map(String::as_str) == Some(label))
            .map(|row| &row[1..])
    }

    /// Writes the table as CSV, header first.
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(writer);
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Renders the table as a CSV string.
    pub fn to_csv(&self) -> Result<String, csv::Error> {
        let mut buffer = Vec::new();
        self.write_csv(&mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::AssignmentRatio;

    fn sample_traffic() -> TrafficResult {
        TrafficResult {
            experiments: vec!["checkout".to_string(), "banner".to_string()],
            priorities: vec![1, 2],
            sampling_percentages: vec![0.5, 0.4],
            assignment_ratios: vec![
                AssignmentRatio {
                    date: "2024-01-02".to_string(),
                    values: vec![0.5012, 0.1988],
                },
                AssignmentRatio {
                    date: "2024-01-03".to_string(),
                    values: vec![0.055, 0.0],
                },
            ],
        }
    }

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(0.055), "5.50%");
        assert_eq!(format_percent(0.2), "20.00%");
        assert_eq!(format_percent(0.0), "0.00%");
        assert_eq!(format_percent(1.0), "100.00%");
    }

    #[test]
    fn test_skeleton_layout() {
        let table = TrafficTable::skeleton(&sample_traffic());
        assert_eq!(table.columns, vec!["Experiments:", "checkout", "banner"]);
        assert_eq!(table.rows.len(), 4);
        assert_eq!(table.rows[0], vec!["Priority", "1", "2"]);
        assert_eq!(table.rows[1], vec!["Experiment %", "50.00%", "40.00%"]);
        assert_eq!(table.rows[2], vec!["2024-01-02", "50.12%", "19.88%"]);
        assert_eq!(table.rows[3], vec!["2024-01-03", "5.50%", "0.00%"]);
        assert!(!table.has_targets());
    }

    #[test]
    fn test_with_targets_inserts_second_row_by_label() {
        let table = TrafficTable::skeleton(&sample_traffic());
        let mut banner = Experiment::new("b", "banner", 0.4).with_priority(2);
        banner.target_sampling_percent = Some(0.2);
        let mut checkout = Experiment::new("c", "checkout", 0.5).with_priority(1);
        checkout.target_sampling_percent = Some(0.5);

        let with_targets = table.with_targets(&[banner, checkout]);
        assert_eq!(with_targets.rows.len(), 5);
        assert_eq!(with_targets.rows[1], vec!["Target %", "50.00%", "20.00%"]);
        assert_eq!(with_targets.rows[2][0], "Experiment %");
        // The source table is untouched
        assert!(!table.has_targets());
    }

    #[test]
    fn test_with_targets_replaces_existing_row() {
        let table = TrafficTable::skeleton(&sample_traffic());
        let mut checkout = Experiment::new("c", "checkout", 0.5);
        checkout.target_sampling_percent = Some(0.5);

        let once = table.with_targets(&[checkout.clone()]);
        let twice = once.with_targets(&[checkout]);
        assert_eq!(twice.rows.len(), 5);
        assert_eq!(twice.row(TARGET_ROW).unwrap(), &["50.00%".to_string(), String::new()]);
    }

    #[test]
    fn test_with_targets_without_header_uses_related_order() {
        let traffic = TrafficResult {
            priorities: vec![1],
            sampling_percentages: vec![0.3],
            ..TrafficResult::default()
        };
        let table = TrafficTable::skeleton(&traffic);
        let mut solo = Experiment::new("s", "solo", 0.3);
        solo.target_sampling_percent = Some(0.3);

        let with_targets = table.with_targets(&[solo]);
        assert_eq!(with_targets.row(TARGET_ROW).unwrap(), &["30.00%".to_string()]);
    }

    #[test]
    fn test_to_csv() {
        let table = TrafficTable::skeleton(&sample_traffic());
        let csv = table.to_csv().unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("Experiments:,checkout,banner"));
        assert_eq!(lines.next(), Some("Priority,1,2"));
        assert_eq!(lines.next(), Some("Experiment %,50.00%,40.00%"));
        assert_eq!(csv.lines().count(), 5);
    }
}
