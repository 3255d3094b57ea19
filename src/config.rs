use std::path::PathBuf;

use crate::{Result, Store};

/// Top-level configuration for a store.
///
/// A configured `path` selects the durable file-backed backend; without
/// one the store is in-memory only.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) table_size: u64,
    pub(crate) log_size: u64,
    pub(crate) path: Option<PathBuf>,
    pub(crate) refresh_interval: u64,
    pub(crate) complete_pending_interval: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            table_size: 1 << 14,
            log_size: 1 << 30, // 1gb
            path: None,
            refresh_interval: 64,
            complete_pending_interval: 1600,
        }
    }
}

macro_rules! builder {
    ($(($name:ident, $get:ident, $set:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc="Get "]
            #[doc=$desc]
            pub fn $get(&self) -> $t {
                self.$name.clone()
            }

            #[doc="Set "]
            #[doc=$desc]
            pub fn $set(&mut self, to: $t) {
                self.$name = to;
            }

            #[doc="Builder, set "]
            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> Config {
                self.$name = to;
                self
            }
        )*
    }
}

impl Config {
    /// Returns a default `Config`
    pub fn new() -> Config {
        Config::default()
    }

    builder!(
        (
            table_size,
            get_table_size,
            set_table_size,
            u64,
            "number of hash index buckets, rounded up to a power of two"
        ),
        (
            log_size,
            get_log_size,
            set_log_size,
            u64,
            "byte budget for record payloads"
        ),
        (
            path,
            get_path,
            set_path,
            Option<PathBuf>,
            "storage directory, or None for an in-memory store"
        ),
        (
            refresh_interval,
            get_refresh_interval,
            set_refresh_interval,
            u64,
            "operations a session may issue between refreshes"
        ),
        (
            complete_pending_interval,
            get_complete_pending_interval,
            set_complete_pending_interval,
            u64,
            "operations a session may issue between draining completions"
        )
    );

    /// Opens a store with this configuration.
    pub fn open(&self) -> Result<Store> {
        Store::open(self.clone())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.table_size == 0 {
            return Err(crate::Error::Unsupported(
                "table_size must be greater than zero".into(),
            ));
        }
        if self.table_size > 1 << 32 {
            return Err(crate::Error::Unsupported(
                "table_size must not exceed 2^32 buckets".into(),
            ));
        }
        if self.refresh_interval == 0 || self.complete_pending_interval == 0 {
            return Err(crate::Error::Unsupported(
                "refresh intervals must be greater than zero".into(),
            ));
        }
        if self.complete_pending_interval % self.refresh_interval != 0 {
            return Err(crate::Error::Unsupported(
                "complete_pending_interval must be a multiple of \
                 refresh_interval"
                    .into(),
            ));
        }
        Ok(())
    }
}
