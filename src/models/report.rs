use serde::{Deserialize, Serialize};

use crate::models::process::Process;

/// Body for `PUT /projects/{id}/reports`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    #[serde(rename = "type")]
    pub report_type: String,
    pub report: ReportBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportBody {
    pub summary: String,
    pub details: ReportDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDetails {
    pub total_media_processed: i64,
    pub total_analyses_completed: i64,
    pub processing_time_minutes: f64,
    pub success_rate: f64,
    pub analysis_types_completed: Vec<String>,
    pub key_findings: Vec<String>,
}

impl QualityReport {
    /// Build the final per-process report from its closed counters.
    pub fn from_process(
        process: &Process,
        media_count: i64,
        analysis_types: Vec<String>,
        key_findings: Vec<String>,
    ) -> Self {
        let elapsed = process
            .completed_at
            .unwrap_or_else(chrono::Utc::now)
            .signed_duration_since(process.created_at);
        let success_rate = if process.total_tasks == 0 {
            0.0
        } else {
            process.completed_tasks as f64 / process.total_tasks as f64
        };
        let summary = format!(
            "{} of {} analyses completed for project {} ({} failed, {} in manual review)",
            process.completed_tasks,
            process.total_tasks,
            process.project_slug,
            process.failed_tasks,
            process.manual_review_tasks,
        );
        Self {
            report_type: "quality_analysis".to_string(),
            report: ReportBody {
                summary,
                details: ReportDetails {
                    total_media_processed: media_count,
                    total_analyses_completed: process.completed_tasks,
                    processing_time_minutes: elapsed.num_seconds() as f64 / 60.0,
                    success_rate,
                    analysis_types_completed: analysis_types,
                    key_findings,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::process::ProcessStatus;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn success_rate_reflects_counters() {
        let now = Utc::now();
        let process = Process {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            client_slug: "acme".into(),
            project_id: Uuid::new_v4(),
            project_slug: "spring".into(),
            project_name: "Spring".into(),
            status: ProcessStatus::Completed,
            total_tasks: 4,
            completed_tasks: 4,
            failed_tasks: 0,
            manual_review_tasks: 0,
            config_snapshot: serde_json::json!({}),
            processing_notified: true,
            completed_notified: true,
            cancel_requested: false,
            created_at: now,
            completed_at: Some(now),
        };
        let report = QualityReport::from_process(&process, 2, vec!["colors".into()], vec![]);
        assert_eq!(report.report.details.total_media_processed, 2);
        assert_eq!(report.report.details.total_analyses_completed, 4);
        assert!((report.report.details.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(report.report_type, "quality_analysis");
    }
}
