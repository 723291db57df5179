use anyhow::{bail, Error};

/// Methods of a long running worker task needed by code that is
/// otherwise unrelated to the task server driving it.
///
/// Implementations supply the abort flag and the log sink; cancellation
/// checking is derived from the flag unless an implementation wants a
/// more specific error.
pub trait WorkerTaskContext {
    /// Whether an abort of the task was requested.
    fn abort_requested(&self) -> bool;

    /// Create a log message for this task.
    fn log(&self, level: log::Level, message: &std::fmt::Arguments);

    /// Fail with a reasonable error message if the task should be
    /// aborted.
    fn check_abort(&self) -> Result<(), Error> {
        if self.abort_requested() {
            bail!("abort requested - aborting task");
        }
        Ok(())
    }
}

impl<T: WorkerTaskContext + ?Sized> WorkerTaskContext for std::sync::Arc<T> {
    fn abort_requested(&self) -> bool {
        T::abort_requested(self)
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        T::log(self, level, message)
    }

    fn check_abort(&self) -> Result<(), Error> {
        T::check_abort(self)
    }
}

/// Target of the `task_*!` macros.
pub fn log_task(task: &dyn WorkerTaskContext, level: log::Level, message: std::fmt::Arguments) {
    task.log(level, &message);
}

#[macro_export]
macro_rules! task_log {
    ($task:expr, $($fmt:tt)+) => {
        $crate::task::log_task(&$task, log::Level::Info, format_args!($($fmt)+))
    };
}

#[macro_export]
macro_rules! task_warn {
    ($task:expr, $($fmt:tt)+) => {
        $crate::task::log_task(&$task, log::Level::Warn, format_args!($($fmt)+))
    };
}

#[macro_export]
macro_rules! task_error {
    ($task:expr, $($fmt:tt)+) => {
        $crate::task::log_task(&$task, log::Level::Error, format_args!($($fmt)+))
    };
}

#[macro_export]
macro_rules! task_debug {
    ($task:expr, $($fmt:tt)+) => {
        $crate::task::log_task(&$task, log::Level::Debug, format_args!($($fmt)+))
    };
}
