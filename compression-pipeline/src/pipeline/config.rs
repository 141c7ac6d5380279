#[derive(Debug, Clone)]
pub struct PipelineTuning {
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_backoff_cap_exponent: u32,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            retry_base_delay_secs: 2,
            retry_max_delay_secs: 5 * 60,
            retry_backoff_cap_exponent: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub tuning: PipelineTuning,
}
