//! Run reporting: JSON results file and a self-contained HTML report

use std::path::{Path, PathBuf};
use tracing::info;

use lingotest_common::{Result, RunSummary};

/// Write the summary as pretty JSON under the output dir
pub fn write_json(summary: &RunSummary, output_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join("test-results.json");
    std::fs::write(&path, serde_json::to_string_pretty(summary)?)?;
    info!(path = %path.display(), "results written");
    Ok(path)
}

/// Write the HTML report under the output dir
pub fn write_html(summary: &RunSummary, output_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join("report.html");
    std::fs::write(&path, render_html(summary))?;
    info!(path = %path.display(), "report written");
    Ok(path)
}

/// Render one row per file with failure call-outs, no external assets
pub fn render_html(summary: &RunSummary) -> String {
    let mut rows = String::new();
    for result in &summary.results {
        let status = if result.is_success() { "pass" } else { "fail" };
        rows.push_str(&format!(
            "<tr class=\"{status}\"><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}ms</td></tr>\n",
            escape(&result.suite),
            escape(&result.file.display().to_string()),
            result.tests,
            result.passed,
            result.failed,
            result.skipped,
            result.duration_ms,
        ));
        for failure in &result.failures {
            rows.push_str(&format!(
                "<tr class=\"detail\"><td colspan=\"7\">✗ {} — {}</td></tr>\n",
                escape(&failure.test),
                escape(&failure.message),
            ));
        }
        for violation in &result.violations {
            rows.push_str(&format!(
                "<tr class=\"detail\"><td colspan=\"7\">⚠ contract {} — {}</td></tr>\n",
                escape(&violation.endpoint),
                escape(&violation.message),
            ));
        }
    }

    let verdict = if summary.is_success() { "PASSED" } else { "FAILED" };
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>LingoReel test report</title>
<style>
body {{ font-family: sans-serif; margin: 2em; }}
table {{ border-collapse: collapse; width: 100%; }}
td, th {{ border: 1px solid #ccc; padding: 4px 8px; text-align: left; }}
tr.pass td:first-child {{ border-left: 4px solid #2a2; }}
tr.fail td:first-child {{ border-left: 4px solid #c22; }}
tr.detail td {{ background: #fee; font-family: monospace; font-size: 0.9em; }}
</style>
</head>
<body>
<h1>LingoReel test report — {verdict}</h1>
<p>{total} tests: {passed} passed, {failed} failed, {skipped} skipped
across {suites} suite(s) ({failed_suites} failing) in {duration_ms}ms</p>
<table>
<tr><th>Suite</th><th>File</th><th>Tests</th><th>Passed</th><th>Failed</th><th>Skipped</th><th>Duration</th></tr>
{rows}</table>
</body>
</html>
"#,
        total = summary.total,
        passed = summary.passed,
        failed = summary.failed,
        skipped = summary.skipped,
        suites = summary.suites,
        failed_suites = summary.failed_suites,
        duration_ms = summary.duration_ms,
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use lingotest_common::TestResult;
    use std::path::Path;

    fn summary() -> RunSummary {
        let ok = TestResult {
            suite: "unit".into(),
            file: "math.spec.ts".into(),
            tests: 2,
            passed: 2,
            failed: 0,
            skipped: 0,
            duration_ms: 12,
            failures: vec![],
            violations: vec![],
        };
        let bad = TestResult::from_error("e2e", Path::new("player.spec.ts"), "<timeout>".into());
        RunSummary::from_results(vec![ok, bad], 99)
    }

    #[test]
    fn test_html_has_row_per_file_and_callouts() {
        let html = render_html(&summary());
        assert!(html.contains("math.spec.ts"));
        assert!(html.contains("player.spec.ts"));
        assert!(html.contains("FAILED"));
        // Failure message is escaped
        assert!(html.contains("&lt;timeout&gt;"));
        assert!(!html.contains("<timeout>"));
    }

    #[test]
    fn test_write_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(&summary(), dir.path()).unwrap();
        let loaded: RunSummary =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(loaded.total, 3);
        assert_eq!(loaded.failed_suites, 1);
    }
}
