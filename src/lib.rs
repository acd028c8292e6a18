#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("rebind only knows the x86_64 and aarch64 syscall ABIs");

pub mod binding;
pub mod canon;
pub mod cli;
pub mod config;
pub mod error;
pub mod execve;
pub mod glue;
pub mod logging;
pub mod path;
pub mod proc;
pub mod syscall;
pub mod tracee;
pub mod tracer;
pub mod translator;
pub mod utils;
