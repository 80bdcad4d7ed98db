//! Worker and czar configuration structs, covering every key in spec.md
//! section 6. Loading these from a TOML file or environment is out of scope
//! (external collaborator, spec.md section 1) -- binaries construct
//! `Default::default()` and override a few fields programmatically, the way
//! the teacher's own `main.rs` does.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemManConfig {
    pub class: String,
    pub memory_mb: u64,
    pub location: String,
}

impl Default for MemManConfig {
    fn default() -> Self {
        Self {
            class: "default".to_string(),
            memory_mb: 4096,
            location: "/tmp/qserv-memman".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub thread_pool_size: usize,
    pub max_pool_threads: usize,
    pub group_size: usize,
    pub required_tasks_completed: u32,
    pub priority_slow: i32,
    pub priority_med: i32,
    pub priority_fast: i32,
    pub priority_snail: i32,
    pub reserve_slow: usize,
    pub reserve_med: usize,
    pub reserve_fast: usize,
    pub reserve_snail: usize,
    pub maxactivechunks_slow: usize,
    pub maxactivechunks_med: usize,
    pub maxactivechunks_fast: usize,
    pub maxactivechunks_snail: usize,
    pub scanmaxminutes_fast: f64,
    pub scanmaxminutes_med: f64,
    pub scanmaxminutes_slow: f64,
    pub scanmaxminutes_snail: f64,
    pub maxtasksbootedperuserquery: u32,
    pub maxconcurrentbootedtasks: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: num_cpus::get(),
            max_pool_threads: num_cpus::get() * 2,
            group_size: 4,
            required_tasks_completed: 3,
            priority_fast: 0,
            priority_med: 1,
            priority_slow: 2,
            priority_snail: 3,
            reserve_fast: 2,
            reserve_med: 2,
            reserve_slow: 1,
            reserve_snail: 1,
            maxactivechunks_fast: 4,
            maxactivechunks_med: 3,
            maxactivechunks_slow: 2,
            maxactivechunks_snail: 1,
            scanmaxminutes_fast: 5.0,
            scanmaxminutes_med: 15.0,
            scanmaxminutes_slow: 60.0,
            scanmaxminutes_snail: 240.0,
            maxtasksbootedperuserquery: 3,
            maxconcurrentbootedtasks: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlConnectionsConfig {
    pub maxsqlconn: usize,
    pub reservedinteractivesqlconn: usize,
}

impl Default for SqlConnectionsConfig {
    fn default() -> Self {
        Self {
            maxsqlconn: 64,
            reservedinteractivesqlconn: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmitConfig {
    pub buffermaxtotalgb: f64,
    pub maxtransmits: usize,
    pub maxperqid: usize,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            buffermaxtotalgb: 4.0,
            maxtransmits: 40,
            maxperqid: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultsProtocol {
    Http,
    Xroot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    pub dirname: String,
    pub xrootd_port: u16,
    pub num_http_threads: usize,
    pub protocol: ResultsProtocol,
    pub clean_up_on_start: bool,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            dirname: "results".to_string(),
            xrootd_port: 1094,
            num_http_threads: 4,
            protocol: ResultsProtocol::Http,
            clean_up_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub instance_id: String,
    pub auth_key: String,
    pub admin_auth_key: String,
    pub registry_host: String,
    pub registry_port: u16,
    pub registry_heartbeat_ival_sec: u64,
    pub http_port: u16,
    pub num_http_threads: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            instance_id: "qserv".to_string(),
            auth_key: String::new(),
            admin_auth_key: String::new(),
            registry_host: "localhost".to_string(),
            registry_port: 25082,
            registry_heartbeat_ival_sec: 10,
            http_port: 25000,
            num_http_threads: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MysqlConfig {
    pub port: u16,
    pub socket: Option<String>,
    pub username: String,
    pub password: String,
    pub hostname: String,
    pub db: String,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            port: 3306,
            socket: None,
            username: "qsmaster".to_string(),
            password: String::new(),
            hostname: "localhost".to_string(),
            db: "qservw_worker".to_string(),
        }
    }
}

/// Worker-side aggregate configuration, one struct per spec.md section 6
/// config-key family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub memman: MemManConfig,
    pub scheduler: SchedulerConfig,
    pub sqlconnections: SqlConnectionsConfig,
    pub transmit: TransmitConfig,
    pub results: ResultsConfig,
    pub replication: ReplicationConfig,
    pub mysql: MysqlConfig,
}

/// Czar-side configuration: replication envelope plus dispatch tuning that
/// has no worker-side counterpart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CzarConfig {
    pub name: String,
    pub replication: ReplicationConfig,
    pub status_interval_sec: f64,
    pub status_max_lifetime_sec: f64,
    pub max_attempts: u32,
    pub request_expiration_ival_sec: u64,
    pub http_max_tries: u32,
    pub file_collect_pool_size: usize,
    pub dispatch_pool_size: usize,
    pub evict_timeout_sec: u64,
    pub response_timeout_sec: u64,
}

impl Default for CzarConfig {
    fn default() -> Self {
        Self {
            name: "czar".to_string(),
            replication: ReplicationConfig::default(),
            status_interval_sec: 1.0,
            status_max_lifetime_sec: 300.0,
            max_attempts: 3,
            request_expiration_ival_sec: 300,
            http_max_tries: 2,
            file_collect_pool_size: 16,
            dispatch_pool_size: 16,
            evict_timeout_sec: 30,
            response_timeout_sec: 5,
        }
    }
}
