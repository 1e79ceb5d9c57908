mod cache;
mod compile;
mod fault;
mod patch;

pub mod emit;
pub mod runtime;
pub mod signal;


pub use crate::{
    cache::CodeCache,
    compile::{Jit, JitConfig, LiteralCacheEntry},
    fault::{handle_fault, FaultDescription, FaultOutcome, FaultReason},
    patch::rewrite,
};
