//! In-process host program
//!
//! The program being instrumented: a method table whose bodies are native
//! closures or instruction lists, with every call routed through the
//! method's interceptor chain.

mod interp;
pub mod program;
pub mod sample_program;
pub mod value;

pub use program::{IlBody, MethodBody, NativeFn, Program};
pub use sample_program::SampleProgram;
pub use value::{Object, StructValue, Value};
