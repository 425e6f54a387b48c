pub mod server;

/// Action resolved from the command line.
#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        dsn: String,
        limiter_rps: f64,
        limiter_burst: u32,
        limiter_enabled: bool,
        drain_timeout_seconds: u64,
        task_drain_timeout_seconds: Option<u64>,
        cors_trusted_origins: Vec<String>,
    },
}
