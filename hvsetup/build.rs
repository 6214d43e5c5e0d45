//! This build script reads the setup configuration from the file named by the `HVSETUP_CONFIG`
//! environment variable (default: `configs/default.toml`), and outputs it to
//! `$(OUT_DIR)/setup_config.rs` to be used by `src/config.rs`.
//!
//! The configuration file is a TOML table with the keys:
//! - `stack_size`: bytes of monitor stack, a non-zero multiple of 4096.
//! - `pool_extra_pages`: pages always added to the allocation pool.
//! - `log_level`: the maximum log level.
//!
//! If the file cannot be read or a value is invalid, the build script outputs a
//! `compile_error!` macro that will cause the build to fail.
//!
//! This build script reruns if the `HVSETUP_CONFIG` environment variable changes, or if the
//! `build.rs` file changes, or if the configuration file changes.
use std::{
    env, fs,
    io::{self, Write},
    path::PathBuf,
};

use toml::Value;

static DEFAULT_CONFIG_PATH: &str = "configs/default.toml";

const PAGE_SIZE: i64 = 4096;
const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

/// Setup configuration after validation.
struct SetupConfig {
    stack_size: usize,
    pool_extra_pages: usize,
    log_level: String,
}

/// Gets the configuration path from `HVSETUP_CONFIG`, falling back to the default file.
fn get_config_path() -> PathBuf {
    env::var_os("HVSETUP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap()).join(DEFAULT_CONFIG_PATH)
        })
}

fn get_integer(table: &Value, key: &str, default: i64) -> Result<i64, String> {
    match table.get(key) {
        Some(v) => v
            .as_integer()
            .ok_or_else(|| format!("`{}` must be an integer", key)),
        None => Ok(default),
    }
}

/// Reads and validates the configuration file.
fn get_config(path: &PathBuf) -> Result<SetupConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read file {}: {}", path.display(), e))?;
    let table = content
        .parse::<Value>()
        .map_err(|e| format!("Failed to parse file {}: {}", path.display(), e))?;

    let stack_size = get_integer(&table, "stack_size", 4 * PAGE_SIZE)?;
    if stack_size <= 0 || stack_size % PAGE_SIZE != 0 {
        return Err(format!(
            "`stack_size` must be a non-zero multiple of {}, got {}",
            PAGE_SIZE, stack_size
        ));
    }

    let pool_extra_pages = get_integer(&table, "pool_extra_pages", 0)?;
    if pool_extra_pages < 0 {
        return Err(format!(
            "`pool_extra_pages` must not be negative, got {}",
            pool_extra_pages
        ));
    }

    let log_level = match table.get("log_level") {
        Some(v) => v
            .as_str()
            .ok_or_else(|| "`log_level` must be a string".to_string())?
            .to_lowercase(),
        None => "info".to_string(),
    };
    if !LOG_LEVELS.contains(&log_level.as_str()) {
        return Err(format!("unknown `log_level` {:?}", log_level));
    }

    Ok(SetupConfig {
        stack_size: stack_size as usize,
        pool_extra_pages: pool_extra_pages as usize,
        log_level,
    })
}

/// Opens the output file for writing.
///
/// Returns the file handle.
fn open_output_file() -> fs::File {
    let output_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let output_file = output_dir.join("setup_config.rs");

    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(output_file)
        .unwrap()
}

fn main() -> io::Result<()> {
    let path = get_config_path();
    let mut output_file = open_output_file();

    println!("cargo:rerun-if-env-changed=HVSETUP_CONFIG");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={}", path.display());

    match get_config(&path) {
        Ok(config) => {
            writeln!(output_file, "/// Bytes reserved for the monitor stack.")?;
            writeln!(
                output_file,
                "pub const VMM_MIN_STACK_SIZE: usize = {:#x};",
                config.stack_size
            )?;
            writeln!(output_file, "/// Pages always added to the allocation pool.")?;
            writeln!(
                output_file,
                "pub const POOL_EXTRA_PAGES: usize = {};",
                config.pool_extra_pages
            )?;
            writeln!(output_file, "/// Maximum log level.")?;
            writeln!(
                output_file,
                "pub const LOG_LEVEL: &str = {:?};",
                config.log_level
            )?;
        }
        Err(error) => {
            writeln!(output_file, "compile_error!({:?});", error)?;
        }
    }
    Ok(())
}
