//! Splicing compiled snippets into method bodies
//!
//! Start from a [`ClassEditor`], pick a method with [`ClassEditor::method`], then edit the body
//! through the returned [`Behavior`]:
//!
//! ```no_run
//! use classpatch::patch::ClassEditor;
//!
//! let mut editor = ClassEditor::load("Foo.class")?;
//! let mut method = editor.method("compute", Some("(I)I"))?;
//! method.insert_before("iload $1; iconst 1; iadd; istore $1")?;
//! method.insert_after(
//!     "getstatic java/lang/System.out:Ljava/io/PrintStream;
//!      ldc \"leaving compute\"
//!      invokevirtual java/io/PrintStream.println:(Ljava/lang/String;)V",
//!     true,
//! )?;
//! editor.save_to_path("out/Foo.class")?;
//! # Ok::<(), classpatch::patch::Error>(())
//! ```
//!
//! Edits either apply completely or leave the method untouched.

mod behavior;
mod editor;
mod errors;

pub use behavior::*;
pub use editor::*;
pub use errors::*;
