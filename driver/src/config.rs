use aqueduct::driver::context::{DriverContext, ThreadingMode};
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk driver configuration. Every field is optional; whatever is
/// absent falls back to the `DriverContext` default.
#[derive(Serialize, Deserialize, Default)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSection,
    #[serde(default)]
    pub resolver: ResolverSection,
}

#[derive(Serialize, Deserialize, Default)]
pub struct DriverSection {
    pub dir: Option<PathBuf>,
    pub threading_mode: Option<ThreadingMode>,
    pub term_length: Option<usize>,
    pub ipc_term_length: Option<usize>,
    pub mtu_length: Option<usize>,
    pub initial_window_length: Option<usize>,
    pub client_liveness_timeout_ms: Option<i64>,
    pub image_liveness_timeout_ms: Option<i64>,
    pub publication_linger_timeout_ms: Option<i64>,
    pub publication_unblock_timeout_ms: Option<i64>,
    pub enable_termination: Option<bool>,
}

#[derive(Serialize, Deserialize, Default)]
pub struct ResolverSection {
    pub name: Option<String>,
    pub interface: Option<String>,
    pub bootstrap_neighbor: Option<String>,
}

const MS_TO_NS: i64 = 1_000_000;

impl DriverConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<DriverConfig, String> {
        serdeconv::from_toml_file(path).map_err(|err| err.to_string())
    }

    /// Fold this file over the default context.
    pub fn into_context(self) -> DriverContext {
        let mut ctx = DriverContext::default();
        let driver = self.driver;

        if let Some(dir) = driver.dir {
            ctx.driver_dir = dir;
        }
        if let Some(mode) = driver.threading_mode {
            ctx.threading_mode = mode;
        }
        if let Some(value) = driver.term_length {
            ctx.term_length = value;
        }
        if let Some(value) = driver.ipc_term_length {
            ctx.ipc_term_length = value;
        }
        if let Some(value) = driver.mtu_length {
            ctx.mtu_length = value;
        }
        if let Some(value) = driver.initial_window_length {
            ctx.initial_window_length = value;
        }
        if let Some(value) = driver.client_liveness_timeout_ms {
            ctx.client_liveness_timeout_ns = value * MS_TO_NS;
        }
        if let Some(value) = driver.image_liveness_timeout_ms {
            ctx.image_liveness_timeout_ns = value * MS_TO_NS;
        }
        if let Some(value) = driver.publication_linger_timeout_ms {
            ctx.publication_linger_timeout_ns = value * MS_TO_NS;
        }
        if let Some(value) = driver.publication_unblock_timeout_ms {
            ctx.publication_unblock_timeout_ns = value * MS_TO_NS;
        }
        if let Some(value) = driver.enable_termination {
            ctx.enable_driver_termination = value;
        }

        ctx.resolver_name = self.resolver.name;
        ctx.resolver_interface = self.resolver.interface;
        ctx.resolver_bootstrap_neighbor = self.resolver.bootstrap_neighbor;

        ctx
    }
}
