//! The invocation recorder (C7): a built-in subscriber that watches the event stream for one run
//! and, once it is done, writes both a binary `Invocation` record and a JUnit `tests.xml` under
//! `<smelt_root>/smelt-out/`. Execution metadata comes from `ExecutionStart`; test results come
//! from every `CommandFinished`, regardless of the command's own type -- a build that fails is
//! just as reportable as a test that fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use prost::Message as _;
use smelt_events::{CommandEventVariant, Event, EventPayload, EventStream, InvokeEventVariant};
use smelt_proto::{Invocation, TestOutputs as ProtoTestOutputs, TestResult};
use smelt_types::CStatus;

/// Tracks one in-flight command between its `Started` and `Finished` events, for `duration` and
/// `system_out` in the eventual JUnit record.
#[derive(Debug, Default)]
struct InFlight {
    started_at: Option<SystemTime>,
    stdout: Vec<u8>,
}

#[derive(Debug, Default)]
struct Builder {
    invoke_id: String,
    rundate: Option<prost_types::Timestamp>,
    username: Option<String>,
    repo: Option<String>,
    branch: Option<String>,
    hostname: Option<String>,
    smelt_root: String,
    executed_tests: Vec<TestResult>,
    in_flight: HashMap<String, InFlight>,
}

pub struct InvocationRecorder {
    out_dir: PathBuf,
}

impl InvocationRecorder {
    pub fn new(smelt_root: impl Into<PathBuf>) -> Self {
        InvocationRecorder { out_dir: smelt_root.into().join("smelt-out") }
    }

    /// Drains `stream` to completion, then writes `invocation.bin` and `tests.xml`. Intended to be
    /// spawned onto its own task alongside the run it is watching.
    pub async fn watch(self, stream: EventStream) -> anyhow::Result<()> {
        let mut builder = Builder::default();

        loop {
            match stream.try_pop() {
                Some(event) => {
                    builder.invoke_id = event.trace_id.to_string();
                    self.observe(&mut builder, event);
                }
                None => {
                    if stream.is_done() {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }

        std::fs::create_dir_all(&self.out_dir)?;
        self.write_invocation(&builder)?;
        self.write_junit(&builder)?;
        Ok(())
    }

    fn observe(&self, builder: &mut Builder, event: Event) {
        let time = event.time;
        match event.payload {
            EventPayload::Invoke(InvokeEventVariant::Start(start)) => {
                builder.smelt_root = start.smelt_root;
                builder.username = Some(start.username).filter(|s| !s.is_empty());
                builder.repo = Some(start.git_repo).filter(|s| !s.is_empty());
                builder.branch = Some(start.git_branch).filter(|s| !s.is_empty());
                builder.hostname = Some(start.hostname).filter(|s| !s.is_empty());
                builder.rundate = Some(prost_types::Timestamp::from(time));
            }
            EventPayload::Command(c) => match c.variant {
                CommandEventVariant::Started => {
                    builder.in_flight.entry(c.command_ref).or_default().started_at = Some(time);
                }
                CommandEventVariant::Stdout(bytes) => {
                    builder.in_flight.entry(c.command_ref).or_default().stdout.extend_from_slice(&bytes);
                }
                CommandEventVariant::Finished { exit_code, outputs, .. } => {
                    let in_flight = builder.in_flight.remove(&c.command_ref);
                    let duration_secs = in_flight
                        .as_ref()
                        .and_then(|f| f.started_at)
                        .and_then(|started| time.duration_since(started).ok())
                        .map(|d| d.as_secs_f64())
                        .unwrap_or(0.0);
                    let log_excerpt = in_flight.map(|f| String::from_utf8_lossy(&f.stdout).into_owned()).unwrap_or_default();
                    builder.executed_tests.push(TestResult {
                        test_name: c.command_ref,
                        outputs: Some(ProtoTestOutputs { artifacts: outputs.artifacts, exit_code }),
                        duration_secs,
                        log_excerpt,
                    });
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn write_invocation(&self, builder: &Builder) -> anyhow::Result<()> {
        let invocation = Invocation {
            invoke_id: builder.invoke_id.clone(),
            rundate: builder.rundate.clone(),
            user: builder.username.clone(),
            repo: builder.repo.clone(),
            branch: builder.branch.clone(),
            hostname: builder.hostname.clone(),
            smelt_root: builder.smelt_root.clone(),
            executed_tests: builder.executed_tests.clone(),
        };
        let mut buf = Vec::with_capacity(invocation.encoded_len());
        invocation.encode(&mut buf)?;
        std::fs::write(self.out_dir.join("invocation.bin"), buf)?;
        Ok(())
    }

    fn write_junit(&self, builder: &Builder) -> anyhow::Result<()> {
        write_junit_xml(&self.out_dir.join("tests.xml"), &builder.executed_tests)
    }
}

fn write_junit_xml(path: &Path, tests: &[TestResult]) -> anyhow::Result<()> {
    let failures = tests.iter().filter(|t| status_of(t) == CStatus::Fail).count();
    let mut xml = String::new();
    xml.push_str(&format!(
        "<testsuite name=\"smelt\" tests=\"{}\" failures=\"{}\">\n",
        tests.len(),
        failures
    ));
    for test in tests {
        xml.push_str(&format!(
            "  <testcase name=\"{}\" time=\"{:.3}\">\n",
            escape(&test.test_name),
            test.duration_secs
        ));
        if status_of(test) == CStatus::Fail {
            let exit_code = test.outputs.as_ref().map(|o| o.exit_code).unwrap_or(-1);
            xml.push_str(&format!("    <failure message=\"exit code {exit_code}\"/>\n"));
        }
        if !test.log_excerpt.is_empty() {
            xml.push_str(&format!("    <system-out>{}</system-out>\n", escape(&test.log_excerpt)));
        }
        xml.push_str("  </testcase>\n");
    }
    xml.push_str("</testsuite>\n");
    std::fs::write(path, xml)?;
    Ok(())
}

fn status_of(test: &TestResult) -> CStatus {
    match test.outputs.as_ref().map(|o| o.exit_code) {
        Some(0) => CStatus::Pass,
        Some(_) => CStatus::Fail,
        None => CStatus::Skipped,
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use smelt_events::{CommandEventVariant, Event, TraceId};
    use tokio::time::{sleep, Duration};

    fn test_result(name: &str, exit_code: i32) -> TestResult {
        TestResult {
            test_name: name.to_owned(),
            outputs: Some(ProtoTestOutputs { artifacts: vec![], exit_code }),
            duration_secs: 0.0,
            log_excerpt: String::new(),
        }
    }

    #[test]
    fn junit_xml_reports_failures_in_the_summary_count() {
        let tests = vec![test_result("a", 0), test_result("b", 1)];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tests.xml");
        write_junit_xml(&path, &tests).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("tests=\"2\""));
        assert!(contents.contains("failures=\"1\""));
    }

    #[test]
    fn junit_xml_carries_duration_and_captured_stdout() {
        let mut result = test_result("a", 0);
        result.duration_secs = 1.5;
        result.log_excerpt = "hello from the test".to_owned();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tests.xml");
        write_junit_xml(&path, &[result]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("time=\"1.500\""));
        assert!(contents.contains("<system-out>hello from the test</system-out>"));
    }

    #[tokio::test]
    async fn observe_appends_every_finished_command_regardless_of_type() {
        let recorder = InvocationRecorder::new("/tmp");
        let mut builder = Builder::default();
        let trace_id = TraceId::new();

        recorder.observe(&mut builder, Event::command(trace_id, "build_it", CommandEventVariant::Started));
        sleep(Duration::from_millis(5)).await;
        recorder.observe(
            &mut builder,
            Event::command(
                trace_id,
                "build_it",
                CommandEventVariant::Finished {
                    exit_code: 0,
                    outputs: smelt_events::TestOutputs::default(),
                    command_type: "build".to_owned(),
                },
            ),
        );

        assert_eq!(builder.executed_tests.len(), 1);
        assert_eq!(builder.executed_tests[0].test_name, "build_it");
        assert!(builder.executed_tests[0].duration_secs > 0.0);
    }
}
