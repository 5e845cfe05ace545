//! Operator-facing output.
//!
//! Command reports, lifecycle notices and chat lines go to a `Console`.
//! Diagnostics go to tracing instead.

/// Where operator-facing text is displayed.
pub trait Console: Send + Sync {
    fn display(&self, message: &str);
}

/// Prints each message on its own stdout line.
pub struct Stdout;

impl Console for Stdout {
    fn display(&self, message: &str) {
        println!("{message}");
    }
}

/// What the console loop should do after handling a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

#[cfg(test)]
pub use transcript::Transcript;
