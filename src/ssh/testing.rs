//! Scripted in-memory transport for tests

use super::{ExecOutput, ExecRequest, Transport};
use crate::error::{AppError, AppResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Rule {
    pattern: String,
    output: AppResult<ExecOutput>,
}

/// Answers commands from a script. The most recently added rule whose
/// pattern occurs in the command text or stdin wins; anything else exits 0
/// with no output.
pub struct ScriptedTransport {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<ExecRequest>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    connected: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rules: Mutex::new(vec![]),
            calls: Mutex::new(vec![]),
            files: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        })
    }

    pub fn on(&self, pattern: &str, code: i32, stdout: &str, stderr: &str) -> &Self {
        self.push(pattern, Some(code), stdout, stderr)
    }

    /// Respond without an exit code
    pub fn on_no_code(&self, pattern: &str, stdout: &str) -> &Self {
        self.push(pattern, None, stdout, "")
    }

    /// Fail the transport itself
    pub fn on_failure(&self, pattern: &str) -> &Self {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            output: Err(AppError::Connection("Connection reset".to_string())),
        });
        self
    }

    fn push(&self, pattern: &str, code: Option<i32>, stdout: &str, stderr: &str) -> &Self {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            output: Ok(ExecOutput {
                code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        });
        self
    }

    pub fn put_file(&self, path: &str, contents: &[u8]) {
        self.files.lock().insert(path.to_string(), contents.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn calls(&self) -> Vec<ExecRequest> {
        self.calls.lock().clone()
    }

    /// True when any call's command or stdin contains `needle`
    pub fn ran(&self, needle: &str) -> bool {
        self.calls.lock().iter().any(|call| haystack(call).contains(needle))
    }
}

fn haystack(request: &ExecRequest) -> String {
    format!("{}\n{}", request.command, request.stdin.as_deref().unwrap_or(""))
}

impl Transport for ScriptedTransport {
    fn exec(&self, request: &ExecRequest) -> AppResult<ExecOutput> {
        if !self.is_connected() {
            return Err(AppError::NotConnected);
        }
        self.calls.lock().push(request.clone());

        let text = haystack(request);
        let rules = self.rules.lock();
        match rules.iter().rev().find(|rule| text.contains(&rule.pattern)) {
            Some(Rule { output: Ok(output), .. }) => Ok(output.clone()),
            Some(Rule { output: Err(e), .. }) => Err(AppError::Connection(e.to_string())),
            None => Ok(ExecOutput {
                code: Some(0),
                ..Default::default()
            }),
        }
    }

    fn download(&self, remote_path: &str) -> AppResult<Vec<u8>> {
        self.file(remote_path)
            .ok_or_else(|| AppError::Ssh(format!("No such file: {}", remote_path)))
    }

    fn upload(&self, remote_path: &str, contents: &[u8]) -> AppResult<()> {
        self.put_file(remote_path, contents);
        Ok(())
    }

    fn keepalive(&self) -> AppResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(AppError::NotConnected)
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
