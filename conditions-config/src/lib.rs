use envconfig::Envconfig;
use lazy_static::lazy_static;

#[derive(Debug, Envconfig)]
pub struct Config {
    #[envconfig(from = "CONDITIONS_LOG_LEVEL", default = "info")]
    pub log_level: String,
    /// Upper bound on the number of IOV types a manager can register.
    #[envconfig(from = "CONDITIONS_MAX_IOV_TYPES", default = "32")]
    pub max_iov_types: usize,
    /// Age threshold (in cleanup cycles) of the default cleanup policy. 0 disables it.
    #[envconfig(from = "CONDITIONS_CLEANUP_MAX_AGE", default = "0")]
    pub cleanup_max_age: u32,
    #[envconfig(from = "CONDITIONS_STRESS_THREADS", default = "4")]
    pub stress_threads: usize,
}

impl Config {
    pub fn init() -> Config {
        Config::init_from_env().expect("Failed to load config")
    }
}

lazy_static! {
    pub static ref CONFIG: Config = Config::init();
}
