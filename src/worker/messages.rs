//! Commit message composition (spec §4.6).

use crate::correlator::CorrelationMatch;

const SUMMARY_MAX: usize = 72;
const BODY_MAX: usize = 400;
const FALLBACK_SUMMARY: &str = "Auto-save";

pub fn compose(
    files: &[String],
    additions: u64,
    deletions: u64,
    shadow_branch: &str,
    correlation: Option<&CorrelationMatch>,
) -> String {
    let stripped_files: Vec<String> = files.iter().map(|f| strip_control_chars(f)).collect();

    match correlation {
        Some(m) => compose_correlated(&stripped_files, additions, deletions, shadow_branch, m),
        None => compose_diff_only(&stripped_files, additions, deletions, shadow_branch),
    }
}

fn compose_correlated(
    files: &[String],
    additions: u64,
    deletions: u64,
    shadow_branch: &str,
    m: &CorrelationMatch,
) -> String {
    let raw_text = m.text.as_deref().unwrap_or("");
    let summary = first_non_blank_line(raw_text)
        .map(|l| truncate(&strip_control_chars(l), SUMMARY_MAX))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_SUMMARY.to_string());
    let body = truncate(&strip_control_chars(raw_text), BODY_MAX);

    let mut out = format!("{summary} — {shadow_branch}\n\n{body}\n\n");
    out.push_str(&format!("Session: {}\n", m.session_id));
    out.push_str(&format!("Files: {}\n", files.join(", ")));
    out.push_str(&format!("Changes: +{additions}/-{deletions}\n"));
    out.push_str(&format!("Correlation: {:.2}\n", m.confidence));
    out
}

fn compose_diff_only(files: &[String], additions: u64, deletions: u64, shadow_branch: &str) -> String {
    let mut out = format!("Auto-save ({} files) — {shadow_branch}\n\n", files.len());
    out.push_str(&format!("Files: {}\n", files.join(", ")));
    out.push_str(&format!("Changes: +{additions}/-{deletions}\n"));
    out
}

fn first_non_blank_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|l| !l.is_empty())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn strip_control_chars(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}
