// Cache
pub const FLAG_CACHE_HIT_COUNTER: &str = "flags_cache_hit_total";
pub const FLAG_CACHE_MISS_COUNTER: &str = "flags_cache_miss_total";
pub const FLAG_CACHE_LOAD_ERRORS_COUNTER: &str = "flags_cache_load_errors_total";
pub const FLAG_CACHE_REFRESH_COUNTER: &str = "flags_cache_refresh_total";
pub const FLAG_CACHE_REFRESH_ERRORS_COUNTER: &str = "flags_cache_refresh_errors_total";
pub const FLAG_CACHE_INVALIDATIONS_COUNTER: &str = "flags_cache_invalidations_total";
pub const FLAG_CACHE_SIZE_GAUGE: &str = "flags_cache_size";

// Evaluation
pub const FLAG_REQUESTS_COUNTER: &str = "flags_requests_total";
pub const FLAG_EVALUATIONS_COUNTER: &str = "flags_evaluations_total";
pub const FLAG_EVALUATION_TIME: &str = "flags_evaluation_time";

// Recording
pub const RECORDER_ENQUEUED_COUNTER: &str = "flags_recorder_enqueued_total";
pub const RECORDER_DROPPED_COUNTER: &str = "flags_recorder_dropped_total";
pub const RECORDER_WRITE_ERRORS_COUNTER: &str = "flags_recorder_write_errors_total";

// Analytics and retention
pub const ANALYTICS_QUERY_TIME: &str = "flags_analytics_query_time";
pub const RETENTION_DELETED_COUNTER: &str = "flags_retention_deleted_total";
pub const RETENTION_ERRORS_COUNTER: &str = "flags_retention_errors_total";
pub const RETENTION_LAST_RUN_GAUGE: &str = "flags_retention_last_run_timestamp";
