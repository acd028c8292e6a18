use env_logger::{Builder, Env};
use log::Level;
use std::io::Write;

fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Initialize logger from `RUST_LOG`, falling back on the `-v` count.
pub fn init_logger(verbose: u8) {
    let env = Env::default().filter_or("RUST_LOG", default_filter(verbose));

    Builder::from_env(env)
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => "error",
                Level::Warn => "warning",
                Level::Info => "info",
                Level::Debug => "debug",
                Level::Trace => "trace",
            };
            writeln!(buf, "rebind {}: {}", level, record.args())
        })
        .init();
}
