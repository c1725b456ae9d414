//! The parsed command language.
use alloc::string::String;
use alloc::vec::Vec;

/// A redirection attached to a [`Simple`] command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// `< word`: reopen fd 0 from `word`.
    In(String),
    /// `> word`: reopen fd 1 from `word`, truncating.
    Out(String),
    /// `>> word`: reopen fd 1 from `word`, appending.
    Append(String),
}

/// A single command: its argument vector and any redirections, in the
/// order they appeared (later redirections of the same fd win).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Simple {
    /// `argv[0]` is the command name.
    pub argv: Vec<String>,
    /// Redirections to apply before running `argv`.
    pub redirects: Vec<Redirect>,
}

/// A `|`-chained sequence of [`Simple`] commands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pipeline {
    /// At least one element; more than one means every adjacent pair is
    /// joined by a pipe, left's stdout to right's stdin.
    pub commands: Vec<Simple>,
}

/// The operator joining two [`Pipeline`]s in a [`Line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Joiner {
    /// `;`: run the next pipeline unconditionally.
    Seq,
    /// `&&`: run the next pipeline only if the previous exited `0`.
    And,
    /// `||`: run the next pipeline only if the previous exited nonzero.
    Or,
}

/// A fully parsed input line: a sequence of pipelines joined by `;`/`&&`/`||`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Line {
    /// The first pipeline.
    pub first: Pipeline,
    /// Subsequent `(joiner, pipeline)` pairs, left-associative.
    pub rest: Vec<(Joiner, Pipeline)>,
}
