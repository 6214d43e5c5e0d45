//! Build-time configuration, generated by `build.rs` from `configs/*.toml`.

use log::LevelFilter;

include!(concat!(env!("OUT_DIR"), "/setup_config.rs"));

const _: () = assert!(VMM_MIN_STACK_SIZE > 0 && VMM_MIN_STACK_SIZE % hvaddrspace::PAGE_SIZE == 0);

/// The configured maximum log level.
pub fn log_level() -> LevelFilter {
    match LOG_LEVEL {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Parses the `key=decimal` option `key` out of a module command line.
///
/// Options are separated by whitespace. The first word of a multiboot
/// command line is usually the module path, it never matches since it has
/// no `=`. An option with a value that is not a decimal number is ignored.
pub fn get_opt(cmdline: &str, key: &str) -> Option<u64> {
    cmdline
        .split_whitespace()
        .filter_map(|word| word.split_once('='))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| v.parse::<u64>().ok())
}
