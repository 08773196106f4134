//! Per-trial summaries printed while the session runs

use chrono::{DateTime, Utc};
use rig_fsm::{Event, EventKind, StateMatrix};
use serde::Serialize;

/// How trial summaries are written to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    /// One JSON object per line
    Json,
}

/// What happened in one completed trial
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialSummary {
    pub trial: usize,
    /// Controller time of the first event of the trial
    pub start_time: f64,
    /// Controller time of the jump back to state 0
    pub end_time: f64,
    pub n_events: usize,
    /// Rising edges per input line
    pub input_counts: Vec<usize>,
    /// Names of the states entered, in order
    pub states: Vec<String>,
    /// Last state before the trial ended
    pub final_state: String,
    pub reported_at: DateTime<Utc>,
}

impl TrialSummary {
    /// Summarize `events` (one trial, without the closing state-0 event)
    pub fn from_events(trial: usize, events: &[Event], end_time: f64, matrix: &StateMatrix) -> Self {
        let mut input_counts = vec![0; matrix.n_inputs()];
        let mut states = Vec::with_capacity(events.len());
        for event in events {
            if let EventKind::Rising(line) = event.kind(matrix.n_inputs()) {
                if let Some(count) = input_counts.get_mut(line) {
                    *count += 1;
                }
            }
            states.push(state_name(matrix, event.next_state));
        }

        Self {
            trial,
            start_time: events.first().map_or(end_time, |e| e.timestamp),
            end_time,
            n_events: events.len(),
            input_counts,
            final_state: states.last().cloned().unwrap_or_default(),
            states,
            reported_at: Utc::now(),
        }
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

fn state_name(matrix: &StateMatrix, id: usize) -> String {
    matrix
        .state(id)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| format!("#{}", id))
}

/// Render one summary in the requested format
pub fn format_summary(summary: &TrialSummary, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string(summary).unwrap_or_else(|e| {
            log::error!("Failed to serialize trial {}: {}", summary.trial, e);
            String::new()
        }),
        OutputFormat::Text => format!(
            "Trial {:>4}  {:>8.3}s  {:>3} events  inputs {:?}  ended in '{}'",
            summary.trial,
            summary.duration(),
            summary.n_events,
            summary.input_counts,
            summary.final_state
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_fsm::builder::{StateMatrixBuilder, StateSpec, END_TRIAL};
    use rig_fsm::types::FORCED_JUMP;
    use rig_fsm::TRIAL_START_STATE;

    fn matrix() -> StateMatrix {
        let mut builder = StateMatrixBuilder::new(&["C"], &["Valve"]);
        builder.add_state(StateSpec::new("wait").on("Cin", "reward")).unwrap();
        builder
            .add_state(StateSpec::new("reward").timer(0.05).on("Tup", END_TRIAL))
            .unwrap();
        builder.build().unwrap()
    }

    fn events() -> Vec<Event> {
        vec![
            Event::new(1.0, FORCED_JUMP, TRIAL_START_STATE),
            Event::new(1.5, 0, TRIAL_START_STATE + 1),
        ]
    }

    #[test]
    fn test_summary_from_events() {
        let matrix = matrix();
        let summary = TrialSummary::from_events(0, &events(), 1.55, &matrix);
        assert_eq!(summary.n_events, 2);
        assert_eq!(summary.input_counts, vec![1]);
        assert_eq!(summary.states, vec!["wait", "reward"]);
        assert_eq!(summary.final_state, "reward");
        assert!((summary.duration() - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_format_json_line() {
        let matrix = matrix();
        let summary = TrialSummary::from_events(3, &events(), 2.0, &matrix);
        let line = format_summary(&summary, OutputFormat::Json);
        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["trial"], 3);
        assert_eq!(value["final_state"], "reward");
    }

    #[test]
    fn test_format_text() {
        let matrix = matrix();
        let summary = TrialSummary::from_events(0, &[], 2.0, &matrix);
        let line = format_summary(&summary, OutputFormat::Text);
        assert!(line.starts_with("Trial    0"));
        assert!(line.contains("ended in ''"));
    }
}
