//! Operator command interpreter.
//!
//! A `#`-prefixed line is split on whitespace into a `Command`, looked up in
//! the endpoint's command table and, if its precondition holds and its
//! argument parses, turned into the endpoint's action and executed.
//!
//! Both the server and the client bind this interpreter to their own
//! `Endpoint`; the table declares each command's precondition and argument
//! shape so that "not specified" and "not a valid number" fall out of the
//! table rather than out of ad-hoc parsing.

use crate::console::{Console, Flow};
use tracing::debug;

/// One tokenized command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    pub name: &'a str,
    pub args: Vec<&'a str>,
}

impl<'a> Command<'a> {
    /// Split `line` on whitespace. Returns `None` for a blank line.
    pub fn parse(line: &'a str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        Some(Command {
            name,
            args: parts.collect(),
        })
    }
}

/// Expected argument shape of a command, and how it becomes an action.
pub enum Syntax<A> {
    /// No argument; anything extra is ignored.
    Bare(A),
    /// One free-form argument.
    Text {
        label: &'static str,
        build: fn(String) -> A,
    },
    /// One port number argument.
    Port {
        label: &'static str,
        build: fn(u16) -> A,
    },
}

impl<A: Clone> Syntax<A> {
    fn bind(&self, args: &[&str]) -> Result<A, Rejection> {
        match self {
            Syntax::Bare(action) => Ok(action.clone()),
            Syntax::Text { label, build } => args
                .first()
                .map(|arg| build(arg.to_string()))
                .ok_or(Rejection::Missing(*label)),
            Syntax::Port { label, build } => {
                let arg = args.first().ok_or(Rejection::Missing(*label))?;
                arg.parse::<u16>()
                    .map(*build)
                    .map_err(|_| Rejection::NotANumber(*label))
            }
        }
    }
}

/// State a command requires, and what to report when it does not hold.
pub struct Guard<E> {
    pub holds: fn(&E) -> bool,
    pub refusal: &'static str,
}

/// One row of an endpoint's command table
pub struct Entry<E: Endpoint> {
    pub name: &'static str,
    pub guard: Option<Guard<E>>,
    pub syntax: Syntax<E::Action>,
}

/// Something operator commands can control.
pub trait Endpoint: Sized + 'static {
    type Action: Clone;

    /// The fixed command vocabulary, matched case-sensitively.
    fn commands() -> &'static [Entry<Self>];

    /// Apply an action whose precondition and argument already checked out.
    ///
    /// May wait on the network, e.g. to open a connection.
    async fn execute(&self, action: Self::Action) -> Outcome;
}

/// Why a command did nothing. `Display` is the exact operator report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("Command not recognized")]
    Unrecognized,
    #[error("{0}")]
    Precondition(&'static str),
    #[error("{0} not specified")]
    Missing(&'static str),
    #[error("{0} not a valid number")]
    NotANumber(&'static str),
    /// The endpoint tried and the underlying operation failed.
    #[error("{0}")]
    Failed(String),
}

/// Result of interpreting one command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Report(String),
    Rejected(Rejection),
    /// The process should shut down.
    Terminate,
}

impl Outcome {
    /// Show the outcome on `console` and tell the run loop how to continue.
    pub fn settle(self, console: &dyn Console) -> Flow {
        match self {
            Outcome::Done => Flow::Continue,
            Outcome::Report(message) => {
                console.display(&message);
                Flow::Continue
            }
            Outcome::Rejected(rejection) => {
                console.display(&rejection.to_string());
                Flow::Continue
            }
            Outcome::Terminate => Flow::Exit,
        }
    }
}

/// Interpret one operator line against `endpoint`.
///
/// Checks run in order: known name, precondition, argument. The first
/// failure is reported and nothing is executed.
pub async fn interpret<E: Endpoint>(endpoint: &E, line: &str) -> Outcome {
    let Some(command) = Command::parse(line) else {
        return Outcome::Rejected(Rejection::Unrecognized);
    };
    let Some(entry) = E::commands().iter().find(|e| e.name == command.name) else {
        debug!(command = command.name, "Unrecognized command");
        return Outcome::Rejected(Rejection::Unrecognized);
    };

    if let Some(guard) = &entry.guard {
        if !(guard.holds)(endpoint) {
            debug!(command = command.name, "Command precondition not met");
            return Outcome::Rejected(Rejection::Precondition(guard.refusal));
        }
    }

    match entry.syntax.bind(&command.args) {
        Ok(action) => {
            debug!(command = command.name, "Executing command");
            endpoint.execute(action).await
        }
        Err(rejection) => Outcome::Rejected(rejection),
    }
}
