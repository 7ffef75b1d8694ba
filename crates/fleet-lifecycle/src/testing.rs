//! Scripted [`CommandRunner`] for exercising lifecycle flows without a
//! container runtime.

use async_trait::async_trait;
use fleet_runner::{CommandRunner, ExecError, ExecResult, RawOutput};
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Clone)]
enum Reply {
    Output(RawOutput),
    Delay(Duration),
    Timeout,
}

struct Rule {
    pattern: String,
    reply: Reply,
}

/// Records every command and answers from substring rules.
///
/// Rules are matched against the argv joined with single spaces (no
/// quoting), first match wins.
/// Commands matching no rule succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    rules: Mutex<Vec<Rule>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with the given exit code and streams.
    pub fn respond(&self, pattern: &str, code: i32, stdout: &str, stderr: &str) -> &Self {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            reply: Reply::Output(RawOutput {
                code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        });
        self
    }

    /// Fail commands containing `pattern` with exit code 1.
    pub fn fail(&self, pattern: &str, stderr: &str) -> &Self {
        self.respond(pattern, 1, "", stderr)
    }

    /// Succeed with empty output after `wait`.
    pub fn delay(&self, pattern: &str, wait: Duration) -> &Self {
        self.rules.lock().push(Rule { pattern: pattern.to_string(), reply: Reply::Delay(wait) });
        self
    }

    /// Time out commands containing `pattern`.
    pub fn time_out(&self, pattern: &str) -> &Self {
        self.rules.lock().push(Rule { pattern: pattern.to_string(), reply: Reply::Timeout });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.contains(pattern)).count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn capture(&self, argv: &[String], timeout: Duration) -> ExecResult<RawOutput> {
        let command = argv.join(" ");
        self.calls.lock().push(command.clone());

        let reply = {
            let rules = self.rules.lock();
            rules.iter().find(|r| command.contains(&r.pattern)).map(|r| r.reply.clone())
        };
        let empty = RawOutput { code: 0, stdout: String::new(), stderr: String::new() };
        match reply {
            Some(Reply::Output(raw)) => Ok(raw),
            Some(Reply::Delay(wait)) => {
                tokio::time::sleep(wait).await;
                Ok(empty)
            }
            Some(Reply::Timeout) => Err(ExecError::Timeout { command, secs: timeout.as_secs() }),
            None => Ok(empty),
        }
    }
}
