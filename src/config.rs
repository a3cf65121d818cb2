//! pfiles configuration persistence (rc-style key=value format)
//!
//! Saves/loads settings to `%APPDATA%/pfiles/pfilesrc` on Windows.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use crate::system::name::{MAX_NAME_BUFFER, MIN_NAME_BUFFER};
use crate::system::open_files::ScanOptions;

/// Get the config file path: %APPDATA%/pfiles/pfilesrc
pub fn config_path() -> Option<PathBuf> {
    std::env::var("APPDATA").ok().map(|appdata| {
        PathBuf::from(appdata).join("pfiles").join("pfilesrc")
    })
}

/// Persistable settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfilesConfig {
    // Scan tuning
    pub name_timeout_ms: u64,
    pub name_buffer_hint: usize,
    pub max_name_attempts: usize,
    pub snapshot_initial_size: usize,

    // Output
    pub dos_paths: bool,
    pub regular_files_only: bool,
}

impl Default for PfilesConfig {
    fn default() -> Self {
        let scan = ScanOptions::default();
        Self {
            name_timeout_ms: scan.name_timeout.as_millis() as u64,
            name_buffer_hint: scan.name_buffer_hint,
            max_name_attempts: scan.max_name_attempts,
            snapshot_initial_size: scan.snapshot_initial_size,
            dos_paths: true,
            regular_files_only: false,
        }
    }
}

impl PfilesConfig {
    /// Load config from file, returning defaults if file doesn't exist
    pub fn load() -> Self {
        let path = match config_path() {
            Some(p) => p,
            None => return Self::default(),
        };

        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    /// Parse rc file content on top of the defaults
    pub fn parse(content: &str) -> Self {
        let mut cfg = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();
                match key {
                    "name_timeout_ms" => {
                        if let Ok(v) = value.parse::<u64>() {
                            cfg.name_timeout_ms = v.clamp(10, 5000);
                        }
                    }
                    "name_buffer_hint" => {
                        if let Some(v) = parse_size(value) {
                            cfg.name_buffer_hint = v.clamp(MIN_NAME_BUFFER, MAX_NAME_BUFFER);
                        }
                    }
                    "max_name_attempts" => {
                        if let Ok(v) = value.parse::<usize>() {
                            cfg.max_name_attempts = v.clamp(1, 64);
                        }
                    }
                    "snapshot_initial_size" => {
                        if let Some(v) = parse_size(value) {
                            cfg.snapshot_initial_size = v.max(4096);
                        }
                    }
                    "dos_paths" => cfg.dos_paths = value == "1",
                    "regular_files_only" => cfg.regular_files_only = value == "1",
                    _ => {} // Ignore unknown keys
                }
            }
        }

        cfg
    }

    /// Render the rc file content
    pub fn render(&self) -> String {
        let b = |v: bool| if v { "1" } else { "0" };

        let lines = [
            "# pfiles configuration file".to_string(),
            String::new(),
            format!("name_timeout_ms={}", self.name_timeout_ms),
            format!("name_buffer_hint={}", self.name_buffer_hint),
            format!("max_name_attempts={}", self.max_name_attempts),
            format!("snapshot_initial_size={:#x}", self.snapshot_initial_size),
            format!("dos_paths={}", b(self.dos_paths)),
            format!("regular_files_only={}", b(self.regular_files_only)),
        ];
        lines.join("\n") + "\n"
    }

    /// Save config to file
    pub fn save(&self) -> io::Result<PathBuf> {
        let path = config_path()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "APPDATA is not set"))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&path)?;
        file.write_all(self.render().as_bytes())?;

        Ok(path)
    }

    /// Scan options described by this config
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            name_timeout: Duration::from_millis(self.name_timeout_ms),
            name_buffer_hint: self.name_buffer_hint,
            max_name_attempts: self.max_name_attempts,
            snapshot_initial_size: self.snapshot_initial_size,
            ..ScanOptions::default()
        }
    }
}

/// Decimal or `0x` hex byte count
fn parse_size(value: &str) -> Option<usize> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
