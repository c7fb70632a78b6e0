pub mod routes {
    pub const HEALTH: &str = "/health";

    pub const JOBS: &str = "/jobs";
    pub const JOB_BY_NAME: &str = "/jobs/{job_name}";
    pub const JOB_WATCH: &str = "/jobs/{job_name}/watch";
    pub const JOB_LOGS: &str = "/jobs/{job_name}/logs";
    pub const JOB_DOWNLOAD: &str = "/jobs/{job_name}/download";
}

pub mod labels {
    /// Selects every job this system created.
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "addlidar";
    pub const MANAGED_BY_SELECTOR: &str = "app.kubernetes.io/managed-by=addlidar";

    pub const JOB_NAME: &str = "addlidar.io/job-name";

    /// Annotation holding the output file name, used to rebuild records on startup.
    pub const OUTPUT_FILE: &str = "addlidar.io/output-file";
}

/// WebSocket close codes used by the status subscription.
pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const UNKNOWN_JOB: u16 = 4404;
    pub const INTERNAL: u16 = 1011;
}
