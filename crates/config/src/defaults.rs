pub const IN_MEMORY_DATABASE_URL: &str = "memory://";

pub fn default_database_url() -> String {
    IN_MEMORY_DATABASE_URL.to_string()
}

pub fn default_max_connections() -> u32 {
    20
}

pub fn default_connect_timeout_secs() -> u64 {
    30
}

pub fn default_max_commit_retries() -> u32 {
    3
}

pub fn default_retry_backoff_ms() -> u64 {
    25
}

pub fn default_log_format() -> String {
    "pretty".to_string()
}

pub fn default_enabled() -> bool {
    true
}

pub fn default_metrics_port() -> u16 {
    9090
}

pub fn default_config_path() -> String {
    "charity_fund.yaml".to_string()
}
