// Thin crate root: the server's process plumbing (signal handling, the
// listener's accept loop) lives in `src/bin.rs`; everything it drives is
// implemented in `mgin-net` (the single-writer engine and its dispatch
// table) and `mgin-config`/`mgin-base` (settings and shared types). This
// lib target exists so integration tests can construct and exercise an
// `Engine` without going through the binary.

pub use mgin_base as base;
pub use mgin_config as config;
pub use mgin_net as net;
