use std::os::unix::ffi::OsStrExt;

use bstr::ByteSlice;
use clap::Parser;
use log::error;

use rebind::cli::Cli;
use rebind::error::TracerError;
use rebind::logging::init_logger;
use rebind::tracer::Tracer;

fn run(cli: &Cli) -> Result<i32, TracerError> {
    let config = cli.config()?;
    let translator = config.translator()?;
    let exec = config.execve()?;

    let mut tracer = Tracer::new(translator, exec);
    let cwd = config.cwd.as_ref().map(|cwd| cwd.as_os_str().as_bytes().as_bstr());
    tracer.launch(config.command(), cwd)?;
    tracer.run()
}

pub fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    // the tracer, and with it the glue, is dropped before exiting
    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            1
        }
    };
    std::process::exit(code)
}
