//! Where step bodies run.

use std::io;
use std::thread;

use crate::config::WorkerOptions;

/// A unit of work handed to a dispatcher: one step attempt.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs step bodies off the scheduling path.
pub trait Dispatch: Send + Sync {
    /// Run `job` for the named step.
    ///
    /// An error means the job was not started; the engine records it as the
    /// step's failure.
    fn spawn(&self, step: &str, job: Job) -> io::Result<()>;
}

/// One dedicated OS thread per in-flight step.
#[derive(Debug, Clone, Default)]
pub struct ThreadDispatcher {
    options: WorkerOptions,
}

impl ThreadDispatcher {
    pub fn new(options: WorkerOptions) -> Self {
        Self { options }
    }

    fn thread_name(&self, step: &str) -> String {
        // Thread names may not contain NUL
        let step: String = step.chars().filter(|c| *c != '\0').collect();
        format!("{}-{}", self.options.thread_name_prefix, step)
    }
}

impl Dispatch for ThreadDispatcher {
    fn spawn(&self, step: &str, job: Job) -> io::Result<()> {
        let mut builder = thread::Builder::new().name(self.thread_name(step));
        if let Some(size) = self.options.stack_size {
            builder = builder.stack_size(size);
        }
        builder.spawn(job).map(|_| ())
    }
}

/// Runs each job to completion on the calling thread.
///
/// Makes scheduling deterministic, which is what tests and single-threaded
/// embedders want; `start` and `poke` then block until the work they
/// trigger settles.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDispatcher;

impl Dispatch for InlineDispatcher {
    fn spawn(&self, _step: &str, job: Job) -> io::Result<()> {
        job();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn inline_runs_on_caller_thread() {
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        InlineDispatcher
            .spawn(
                "step",
                Box::new(move || tx.send(thread::current().id()).unwrap()),
            )
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), caller);
    }

    #[test]
    fn thread_dispatcher_names_threads() {
        let dispatcher = ThreadDispatcher::new(WorkerOptions {
            thread_name_prefix: "import".to_string(),
            stack_size: Some(256 * 1024),
        });
        let (tx, rx) = mpsc::channel();
        dispatcher
            .spawn(
                "parse",
                Box::new(move || {
                    let name = thread::current().name().map(str::to_string);
                    tx.send(name).unwrap();
                }),
            )
            .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("import-parse"));
    }

    #[test]
    fn thread_name_strips_nul() {
        let dispatcher = ThreadDispatcher::default();
        assert_eq!(dispatcher.thread_name("a\0b"), "stepwise-worker-ab");
    }
}
