use crate::analyze::AssertionOutcome;
use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::report::{FixtureFailure, ParamReport, TestReport};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::fmt::Write as _;
use std::path::Path;

pub fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if (c as u32) < 0x20 && !matches!(c, '\n' | '\r' | '\t') => {}
            c => out.push(c),
        }
    }
    out
}

pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
            return String::from_utf8_lossy(&buf[..end]).to_string();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn seconds(ms: u64) -> String {
    format!("{:.3}", ms as f64 / 1000.0)
}

struct SuiteHeader<'a> {
    name: &'a str,
    tests: usize,
    failures: usize,
    errors: usize,
    time_ms: u64,
}

fn open_suite(out: &mut String, header: &SuiteHeader<'_>, host: &str, timestamp: &str) {
    let _ = writeln!(
        out,
        "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" hostname=\"{}\" timestamp=\"{}\" time=\"{}\">",
        escape_xml(header.name),
        header.tests,
        header.failures,
        header.errors,
        escape_xml(host),
        timestamp,
        seconds(header.time_ms),
    );
}

fn write_param_suite(
    out: &mut String,
    package: &str,
    test_name: &str,
    param: &ParamReport,
    host: &str,
    timestamp: &str,
) {
    let suite_name = format!("{package}.{}.{}", param.fixture_key, param.param_name);
    let classname = format!("{test_name}.{}.{}", param.fixture_key, param.param_name);
    open_suite(
        out,
        &SuiteHeader {
            name: &suite_name,
            tests: param.case_count(),
            failures: param.failure_count(),
            errors: param.error_count(),
            time_ms: param.duration_ms,
        },
        host,
        timestamp,
    );
    let run_fixture = param
        .output
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    let _ = writeln!(out, "    <properties>");
    let _ = writeln!(
        out,
        "      <property name=\"run_fixture\" value=\"{}\"/>",
        escape_xml(&run_fixture)
    );
    let _ = writeln!(
        out,
        "      <property name=\"filter_fixture\" value=\"{}\"/>",
        escape_xml(&param.filtered_fixture.display().to_string())
    );
    let _ = writeln!(out, "    </properties>");

    let attachment = format!("[[ATTACHMENT|{run_fixture}]]");
    if let Some(reason) = &param.run_failure {
        let _ = writeln!(
            out,
            "    <testcase name=\"run\" classname=\"{}\" time=\"{}\">",
            escape_xml(&classname),
            seconds(param.duration_ms)
        );
        let _ = writeln!(
            out,
            "      <error message=\"{}\">{}</error>",
            escape_xml(reason),
            escape_xml(reason)
        );
        let _ = writeln!(out, "      <system-out>{}</system-out>", escape_xml(&attachment));
        let _ = writeln!(out, "    </testcase>");
    }
    for result in &param.results {
        let _ = writeln!(
            out,
            "    <testcase name=\"{}\" classname=\"{}\" time=\"{}\">",
            escape_xml(&result.assertion),
            escape_xml(&classname),
            seconds(result.duration_ms)
        );
        match &result.outcome {
            AssertionOutcome::Passed => {}
            AssertionOutcome::Failed(message) => {
                let _ = writeln!(
                    out,
                    "      <failure message=\"{}\">{}</failure>",
                    escape_xml(message),
                    escape_xml(message)
                );
            }
            AssertionOutcome::Error(message) => {
                let _ = writeln!(
                    out,
                    "      <error message=\"{}\">{}</error>",
                    escape_xml(message),
                    escape_xml(message)
                );
            }
        }
        let _ = writeln!(out, "      <system-out>{}</system-out>", escape_xml(&attachment));
        let _ = writeln!(out, "    </testcase>");
    }
    let _ = writeln!(out, "  </testsuite>");
}

fn write_fixture_failure_suite(
    out: &mut String,
    package: &str,
    test_name: &str,
    failure: &FixtureFailure,
    host: &str,
    timestamp: &str,
) {
    open_suite(
        out,
        &SuiteHeader {
            name: &format!("{package}.{}", failure.fixture_key),
            tests: 1,
            failures: 0,
            errors: 1,
            time_ms: 0,
        },
        host,
        timestamp,
    );
    let _ = writeln!(
        out,
        "    <testcase name=\"fixtures\" classname=\"{}\" time=\"0.000\">",
        escape_xml(&format!("{test_name}.{}", failure.fixture_key))
    );
    let _ = writeln!(
        out,
        "      <error message=\"{}\">{}: {}</error>",
        escape_xml(&failure.reason),
        escape_xml(&failure.source),
        escape_xml(&failure.reason)
    );
    let _ = writeln!(out, "    </testcase>");
    let _ = writeln!(out, "  </testsuite>");
}

/// Renders a JUnit document with one `testsuite` per `(fixture, param)`.
pub fn render_junit(package: &str, report: &TestReport, now: DateTime<Utc>) -> String {
    let host = hostname();
    let timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let tests = report.params.iter().map(ParamReport::case_count).sum::<usize>()
        + report.fixture_failures.len();
    let failures = report.params.iter().map(ParamReport::failure_count).sum::<usize>();
    let errors = report.params.iter().map(ParamReport::error_count).sum::<usize>()
        + report.fixture_failures.len();
    let time_ms = report.params.iter().map(|p| p.duration_ms).sum::<u64>();

    let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    let _ = writeln!(
        out,
        "<testsuites name=\"{}\" tests=\"{tests}\" failures=\"{failures}\" errors=\"{errors}\" time=\"{}\">",
        escape_xml(package),
        seconds(time_ms)
    );
    for failure in &report.fixture_failures {
        write_fixture_failure_suite(&mut out, package, &report.test_name, failure, &host, &timestamp);
    }
    for param in &report.params {
        write_param_suite(&mut out, package, &report.test_name, param, &host, &timestamp);
    }
    out.push_str("</testsuites>\n");
    out
}

pub fn write_junit(path: &Path, package: &str, report: &TestReport) -> Result<(), ReplayError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ReplayError::Io(e.to_string()))?;
    }
    std::fs::write(path, render_junit(package, report, Utc::now()))
        .map_err(|e| ReplayError::Io(format!("{}: {e}", path.display())))?;
    append_run_log(
        "info",
        "report.junit.written",
        json!({"path": path.display().to_string(), "package": package}),
    );
    Ok(())
}
