//! Architecture backends

pub mod x86;
