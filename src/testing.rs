//! Scripted command runner for unit tests.

use std::sync::{Arc, Mutex};

use crate::process::{Cmd, CmdError, CmdResult, CommandRunner};

type Handler = Box<dyn Fn(&Cmd) -> Option<Result<CmdResult, CmdError>> + Send + Sync>;

/// Records every command and answers from handlers registered by the test.
///
/// Handlers are consulted newest first; the first one returning `Some` wins.
/// Unmatched commands succeed with empty output.
#[derive(Clone, Default)]
pub(crate) struct FakeRunner {
    calls: Arc<Mutex<Vec<Cmd>>>,
    handlers: Arc<Mutex<Vec<Handler>>>,
}

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `words` with `result`.
    pub(crate) fn on(&self, words: &[&str], result: CmdResult) -> &Self {
        let words: Vec<String> = words.iter().map(|w| w.to_string()).collect();
        self.on_with(move |cmd| {
            let refs: Vec<&str> = words.iter().map(String::as_str).collect();
            cmd.starts_with(&refs).then(|| Ok(result.clone()))
        })
    }

    /// Make commands starting with `words` time out.
    pub(crate) fn timeout_on(&self, words: &[&str]) -> &Self {
        let words: Vec<String> = words.iter().map(|w| w.to_string()).collect();
        self.on_with(move |cmd| {
            let refs: Vec<&str> = words.iter().map(String::as_str).collect();
            cmd.starts_with(&refs).then(|| {
                Err(CmdError::Timeout {
                    command: cmd.to_string(),
                    after: cmd.get_timeout(),
                })
            })
        })
    }

    /// Register an arbitrary handler, e.g. one with filesystem side effects.
    pub(crate) fn on_with<F>(&self, handler: F) -> &Self
    where
        F: Fn(&Cmd) -> Option<Result<CmdResult, CmdError>> + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap().push(Box::new(handler));
        self
    }

    pub(crate) fn calls(&self) -> Vec<Cmd> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded commands starting with `words`.
    pub(crate) fn count(&self, words: &[&str]) -> usize {
        self.calls().iter().filter(|c| c.starts_with(words)).count()
    }
}

impl CommandRunner for FakeRunner {
    fn exec(&self, cmd: &Cmd) -> Result<CmdResult, CmdError> {
        self.calls.lock().unwrap().push(cmd.clone());
        let handlers = self.handlers.lock().unwrap();
        for handler in handlers.iter().rev() {
            if let Some(result) = handler(cmd) {
                return result;
            }
        }
        Ok(CmdResult::ok(""))
    }
}
