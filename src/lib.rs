//! Bytecode patching for compiled JVM class files
//!
//! A [`patch::ClassEditor`] owns one parsed class file and hands out [`patch::Behavior`] handles
//! for its methods and constructors. Those can splice compiled snippets into the method body
//! (before the first instruction, before every return, as an extra catch clause) or replace it
//! outright. Snippets are compiled by a [`snippet::SnippetCompiler`]; the crate ships a small
//! bytecode assembler for that purpose.

pub mod jvm;
pub mod patch;
pub mod snippet;
pub mod util;
