pub mod db;
pub mod job_pool;
pub mod types;
