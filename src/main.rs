//! Thin demo entry point: wires up logging and loads `Options` from an
//! optional config path. There is nothing here to actually run an engine
//! against; integrators link this crate as a library and supply their own
//! `Camera`/`Focuser`/`Mount` implementations.

use std::path::PathBuf;

use celestial_control::config::Options;

fn start_logger() -> anyhow::Result<()> {
    use flexi_logger::{DeferredNow, FileSpec, Logger, Record, TS_DASHES_BLANK_COLONS_DOT_BLANK};

    let format = |w: &mut dyn std::io::Write, now: &mut DeferredNow, record: &Record| -> Result<(), std::io::Error> {
        write!(w, "[{}] {} {}", now.format(TS_DASHES_BLANK_COLONS_DOT_BLANK), record.level(), record.args())
    };

    Logger::try_with_str("info")?
        .log_to_file(FileSpec::default().directory("logs").basename(env!("CARGO_PKG_NAME")))
        .format(format)
        .print_message()
        .start()?;
    Ok(())
}

fn load_options(path: Option<PathBuf>) -> anyhow::Result<Options> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&text)?)
        }
        None => Ok(Options::default()),
    }
}

fn main() -> anyhow::Result<()> {
    start_logger()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let options = load_options(config_path)?;

    log::info!(
        "loaded options: auto_focus.hfr_threshold={} polar_align.direction={:?}",
        options.auto_focus.hfr_threshold,
        options.polar_align.direction
    );
    log::info!("this binary only verifies configuration; wire Camera/Focuser/Mount implementations into the library to actually run an engine");

    Ok(())
}
