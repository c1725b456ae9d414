//! Recursive-descent parser over the token stream.
//!
//! Mirrors the grammar in `line`/`pipeline`/`simple`/`redir`: a sequence of
//! pipelines joined by `;`/`&&`/`||`, each pipeline a sequence of simple
//! commands joined by `|`, each simple command a leading word followed by
//! more words or redirections.
use alloc::string::String;
use alloc::vec::Vec;
use snafu::Snafu;

use crate::ast::{Joiner, Line, Pipeline, Redirect, Simple};
use crate::tokenizer::Token;

/// A syntax error, with enough detail to print a one-line diagnostic.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum Error {
    /// The line has no commands at all (blank, or comment-only).
    #[snafu(display("empty command"))]
    Empty,
    /// `(` or `)` appeared; the grammar reserves but never wires them up.
    #[snafu(display("unexpected parenthesis"))]
    UnexpectedParen,
    /// A redirection operator wasn't followed by a target word.
    #[snafu(display("expected word after redirection"))]
    MissingRedirectTarget,
    /// An operator appeared where a command or word was expected.
    #[snafu(display("unexpected operator"))]
    UnexpectedOperator,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_simple(&mut self) -> Result<Simple, Error> {
        let mut cmd = Simple::default();
        loop {
            match self.peek() {
                Some(Token::Word(_)) => {
                    let Some(Token::Word(w)) = self.next() else {
                        unreachable!()
                    };
                    cmd.argv.push(w);
                }
                Some(Token::Lt) => {
                    self.next();
                    cmd.redirects.push(Redirect::In(self.expect_word()?));
                }
                Some(Token::Gt) => {
                    self.next();
                    cmd.redirects.push(Redirect::Out(self.expect_word()?));
                }
                Some(Token::Append) => {
                    self.next();
                    cmd.redirects.push(Redirect::Append(self.expect_word()?));
                }
                Some(Token::LParen) | Some(Token::RParen) => return UnexpectedParenSnafu.fail(),
                _ => break,
            }
        }
        if cmd.argv.is_empty() {
            return EmptySnafu.fail();
        }
        Ok(cmd)
    }

    fn expect_word(&mut self) -> Result<String, Error> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w),
            _ => MissingRedirectTargetSnafu.fail(),
        }
    }

    fn parse_pipeline(&mut self) -> Result<Pipeline, Error> {
        let mut commands = Vec::new();
        commands.push(self.parse_simple()?);
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.next();
            commands.push(self.parse_simple()?);
        }
        Ok(Pipeline { commands })
    }

    fn parse_line(&mut self) -> Result<Line, Error> {
        let first = self.parse_pipeline()?;
        let mut rest = Vec::new();
        loop {
            let joiner = match self.peek() {
                Some(Token::Semi) => Joiner::Seq,
                Some(Token::AndAnd) => Joiner::And,
                Some(Token::OrOr) => Joiner::Or,
                Some(Token::Comment) | None => break,
                Some(Token::LParen) | Some(Token::RParen) => {
                    return UnexpectedParenSnafu.fail()
                }
                _ => return UnexpectedOperatorSnafu.fail(),
            };
            self.next();
            if matches!(self.peek(), Some(Token::Comment) | None) {
                break;
            }
            rest.push((joiner, self.parse_pipeline()?));
        }
        Ok(Line { first, rest })
    }
}

/// Parses a token stream (as produced by [`crate::tokenizer::tokenize`])
/// into a [`Line`].
pub fn parse(tokens: Vec<Token>) -> Result<Line, Error> {
    if tokens.is_empty() || matches!(tokens[0], Token::Comment) {
        return EmptySnafu.fail();
    }
    Parser { tokens, pos: 0 }.parse_line()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tokenize;

    fn parse_str(s: &str) -> Result<Line, Error> {
        parse(tokenize(s, |_| String::new()))
    }

    #[test]
    fn simple_pipeline() {
        let line = parse_str("cat foo | grep bar").unwrap();
        assert_eq!(line.first.commands.len(), 2);
        assert!(line.rest.is_empty());
    }

    #[test]
    fn redirections_attach_to_their_command() {
        let line = parse_str("sort < in.txt >> out.txt").unwrap();
        assert_eq!(line.first.commands[0].redirects.len(), 2);
    }

    #[test]
    fn and_or_sequencing() {
        let line = parse_str("true && echo a || echo b").unwrap();
        assert_eq!(line.rest.len(), 2);
        assert_eq!(line.rest[0].0, Joiner::And);
        assert_eq!(line.rest[1].0, Joiner::Or);
    }

    #[test]
    fn comment_truncates_the_line() {
        let line = parse_str("echo hi # a comment").unwrap();
        assert_eq!(line.first.commands[0].argv, alloc::vec!["echo", "hi"]);
    }

    #[test]
    fn bare_parenthesis_is_a_syntax_error() {
        assert_eq!(parse_str("echo (hi)"), Err(Error::UnexpectedParen));
    }

    #[test]
    fn empty_line_is_an_error() {
        assert_eq!(parse_str(""), Err(Error::Empty));
        assert_eq!(parse_str("   "), Err(Error::Empty));
    }

    #[test]
    fn dangling_redirect_is_an_error() {
        assert_eq!(parse_str("cat >"), Err(Error::MissingRedirectTarget));
    }
}
