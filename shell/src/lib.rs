//! The command interpreter (C11): tokenizer, recursive-descent parser,
//! variable expansion, bounded history, ANSI line editor, and five
//! built-ins, all layered on `user_lib`'s syscall surface.
#![no_std]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(all(test, not(target_os = "none")))]
#[macro_use]
extern crate std;

pub mod ast;
pub mod editor;
pub mod exec;
pub mod expand;
pub mod history;
pub mod parser;
pub mod tokenizer;
