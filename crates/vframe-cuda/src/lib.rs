#![doc = include_str!("../README.md")]

pub mod backend;
pub mod sys;

pub use backend::CudaBackend;
