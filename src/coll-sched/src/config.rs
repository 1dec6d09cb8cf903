use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const ENABLE_ENV: &str = "MSCCL_ENABLE";
pub const SCHEDULER_PATH_ENV: &str = "MSCCL_SCHEDULER";
pub const ALGO_DIR_ENV: &str = "MSCCL_ALGO_DIR";
pub const SET_STACK_SIZE_ENV: &str = "NCCL_SET_STACK_SIZE";

pub const DEFAULT_SCHEDULER_PATH: &str = "libmsccl-scheduler.so";
pub const ALGO_DEFAULT_DIR: &str = "msccl-algorithms";
pub const UNIT_TEST_ALGO_DEFAULT_DIR: &str = "msccl-unit-test-algorithms";
pub const ALGO_SHARE_DIR: &str = "../share/nccl/msccl-algorithms";
pub const UNIT_TEST_ALGO_SHARE_DIR: &str = "../share/nccl/msccl-unit-test-algorithms";
pub const PACKAGE_ALGO_SHARE_DIR: &str = "/usr/share/nccl/msccl-algorithms";
pub const UNIT_TEST_PACKAGE_ALGO_SHARE_DIR: &str = "/usr/share/nccl/msccl-unit-test-algorithms";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Library providing an external scheduler, resolved by the dynamic loader.
    pub scheduler_path: PathBuf,
    /// Explicit algorithm directory; disables the default search.
    pub algo_dir: Option<PathBuf>,
    /// Directory the runtime library is installed in. When unset, the
    /// directory of the running executable stands in for it, which only
    /// matches when the library ships next to the host binary. Embedders
    /// loading the library from elsewhere should set this explicitly.
    pub install_dir: Option<PathBuf>,
    pub package_share_dir: Option<PathBuf>,
    pub unit_test_mode: bool,
    pub set_stack_size: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            enabled: true,
            scheduler_path: PathBuf::from(DEFAULT_SCHEDULER_PATH),
            algo_dir: None,
            install_dir: None,
            package_share_dir: None,
            unit_test_mode: false,
            set_stack_size: false,
        }
    }
}

impl SchedulerConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = SchedulerConfig::default();
        config.enabled = env_int(ENABLE_ENV, 1) != 0;
        if let Some(path) = env::var_os(SCHEDULER_PATH_ENV) {
            config.scheduler_path = PathBuf::from(path);
        }
        config.algo_dir = env::var_os(ALGO_DIR_ENV).map(PathBuf::from);
        config.set_stack_size = env_int(SET_STACK_SIZE_ENV, 0) == 1;
        config
    }

    /// Directories searched for algorithm files, in order.
    pub fn algo_dir_candidates(&self) -> Vec<PathBuf> {
        if let Some(dir) = &self.algo_dir {
            return vec![dir.clone()];
        }
        let (default_dir, share_dir, package_dir) = if self.unit_test_mode {
            (
                UNIT_TEST_ALGO_DEFAULT_DIR,
                UNIT_TEST_ALGO_SHARE_DIR,
                UNIT_TEST_PACKAGE_ALGO_SHARE_DIR,
            )
        } else {
            (ALGO_DEFAULT_DIR, ALGO_SHARE_DIR, PACKAGE_ALGO_SHARE_DIR)
        };
        let mut candidates = Vec::with_capacity(3);
        if let Some(install_dir) = self.install_dir() {
            candidates.push(install_dir.join(default_dir));
            candidates.push(install_dir.join(share_dir));
        }
        candidates.push(
            self.package_share_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(package_dir)),
        );
        candidates
    }

    fn install_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.install_dir {
            return Some(dir.clone());
        }
        match env::current_exe() {
            Ok(exe) => exe.parent().map(Path::to_path_buf),
            Err(e) => {
                log::warn!("Cannot locate the runtime install directory: {}", e);
                None
            }
        }
    }
}

fn env_int(name: &str, default: i64) -> i64 {
    match env::var(name) {
        Ok(value) if !value.is_empty() => parse_int(&value).unwrap_or_else(|| {
            log::warn!("Ignoring invalid value {:?} for {}, using {}", value, name, default);
            default
        }),
        _ => default,
    }
}

// decimal, 0x-hex and 0-octal, like strtoll with base 0
fn parse_int(value: &str) -> Option<i64> {
    let value = value.trim();
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let parsed = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8)
    } else {
        digits.parse::<i64>()
    };
    parsed.ok().map(|v| if negative { -v } else { v })
}
